//! Shared helpers: an in-process application, a running proxy and bundles.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use action_proxy::{ShutdownSignal, SidecarConfigBuilder, SidecarServer};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{HeaderMap, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;

/// Liveness path used by every test application.
pub const ALIVE_PATH: &str = "/alive";

/// A request received by the test application.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Responder = Arc<dyn Fn(&Recorded) -> Response<Full<Bytes>> + Send + Sync>;

/// In-process HTTP application recording what it receives.
pub struct App {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl App {
    /// Start an application on an ephemeral port.
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&Recorded) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, respond)
    }

    /// Start an application on `listener`.
    pub fn serve<F>(listener: TcpListener, respond: F) -> Self
    where
        F: Fn(&Recorded) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond: Responder = Arc::new(respond);

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = recorded.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let recorded = recorded.clone();
                        let respond = respond.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await.unwrap().to_bytes();
                            let request = Recorded {
                                method: parts.method.to_string(),
                                path: parts.uri.path().to_string(),
                                query: parts.uri.query().map(ToString::to_string),
                                headers: parts.headers,
                                body,
                            };
                            let response = respond(&request);
                            recorded.lock().push(request);
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, requests }
    }

    /// Requests received on `path`.
    pub fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// Proxy configuration pointing at this application.
    pub fn proxy_config(&self) -> SidecarConfigBuilder {
        proxy_config_for(self.addr)
    }
}

/// Proxy configuration targeting `addr`, listening on an ephemeral port.
pub fn proxy_config_for(addr: SocketAddr) -> SidecarConfigBuilder {
    action_proxy::SidecarConfig::builder()
        .listen_addr("127.0.0.1")
        .listen_port(0)
        .proxy_host(addr.ip().to_string())
        .proxy_port(addr.port())
        .alive_path(ALIVE_PATH)
        .alive_delay(Duration::from_millis(20))
}

/// Build a response with a status, content type and body.
pub fn reply(status: u16, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .body(Full::new(body.into()))
        .unwrap()
}

/// An address nothing listens on yet.
pub async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A running proxy.
pub struct Proxy {
    pub addr: SocketAddr,
    pub shutdown: ShutdownSignal,
    client: reqwest::Client,
}

impl Proxy {
    /// Bind and serve a proxy built from `config`.
    pub async fn start(config: SidecarConfigBuilder) -> Self {
        let server = SidecarServer::bind(config.build().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        tokio::spawn(server.run_with_shutdown(shutdown.clone()));

        Self {
            addr,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    /// POST `{"value": value}` to `route`, returning status and JSON body.
    pub async fn call(&self, route: &str, value: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("http://{}{route}", self.addr))
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// `init` call.
    pub async fn init(&self, value: Value) -> (u16, Value) {
        self.call("/init", value).await
    }

    /// `run` call.
    pub async fn run(&self, value: Value) -> (u16, Value) {
        self.call("/run", value).await
    }

    /// Raw request, for status checks outside the JSON protocol.
    pub fn raw(&self, method: reqwest::Method, route: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("http://{}{route}", self.addr))
    }
}

/// Base64 of an in-memory tar.gz holding `files` as executables.
pub fn bundle(files: &[(&str, &str)]) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    {
        let mut builder = tar::Builder::new(&mut encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
    }
    STANDARD.encode(encoder.finish().unwrap())
}

/// Base64 of an in-memory zip holding `files` as executables.
pub fn zip_bundle(files: &[(&str, &str)]) -> String {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().unix_permissions(0o755);
    for (path, content) in files {
        writer.start_file(*path, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    STANDARD.encode(writer.finish().unwrap().into_inner())
}
