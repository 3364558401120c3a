//! Invocation server: `POST /init` and `POST /run`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::SidecarConfig;
use crate::error::{ErrorResponse, ProxyError, ProxyResult};
use crate::forward::{emit_activation_marker, handle_run};
use crate::init::handle_init;
use crate::invocation::{Envelope, InitParams};
use crate::shutdown::{ConnectionTracker, ShutdownSignal};
use crate::state::ProxyState;

/// How long shutdown waits for open connections.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes served to the invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `POST /init`
    Init,
    /// `POST /run`
    Run,
}

impl Route {
    /// Resolve a request line to a route.
    ///
    /// Returns the status to reply with when nothing matches: 404 for an
    /// unknown path, 405 for a known path with another method.
    pub fn resolve(method: &Method, path: &str) -> Result<Self, StatusCode> {
        let route = match path {
            "/init" => Self::Init,
            "/run" => Self::Run,
            _ => return Err(StatusCode::NOT_FOUND),
        };
        if method == Method::POST {
            Ok(route)
        } else {
            Err(StatusCode::METHOD_NOT_ALLOWED)
        }
    }

    /// Route name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Run => "run",
        }
    }
}

/// Sidecar server bound to its listening socket.
pub struct SidecarServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    max_body_size: usize,
}

impl SidecarServer {
    /// Bind the listening socket and build the shared state.
    pub async fn bind(config: SidecarConfig) -> ProxyResult<Self> {
        let ip = config
            .server
            .listen_addr
            .parse()
            .map_err(|e| ProxyError::config(format!("invalid listen address: {e}")))?;
        let addr = SocketAddr::new(ip, config.server.listen_port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::server(format!("failed to bind {addr}: {e}")))?;

        Ok(Self {
            listener,
            state: Arc::new(ProxyState::new(&config)?),
            max_body_size: config.server.max_request_body_size,
        })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared proxy state.
    pub fn state(&self) -> Arc<ProxyState> {
        self.state.clone()
    }

    /// Serve until SIGTERM or SIGINT.
    pub async fn run(self) -> ProxyResult<()> {
        self.run_with_shutdown(ShutdownSignal::with_os_signals())
            .await
    }

    /// Serve until `shutdown` triggers, then drain open connections.
    pub async fn run_with_shutdown(self, shutdown: ShutdownSignal) -> ProxyResult<()> {
        let addr = self.local_addr()?;
        info!(%addr, target_url = %self.state.proxy_config().base_url(), "action proxy listening");

        let connections = ConnectionTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
                () = shutdown.recv() => break,
            };

            let state = self.state.clone();
            let max_body_size = self.max_body_size;
            let shutdown = shutdown.clone();
            let guard = connections.acquire();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = state.clone();
                    async move {
                        Ok::<_, Infallible>(handle_request(req, &state, max_body_size).await)
                    }
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    () = shutdown.recv() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = result {
                    debug!(%peer, error = %e, "connection error");
                }
                drop(guard);
            });
        }

        info!(
            active = connections.active_connections(),
            "shutting down, draining connections"
        );
        tokio::select! {
            () = connections.drained() => info!("all connections closed"),
            () = tokio::time::sleep(DRAIN_TIMEOUT) => warn!(
                active = connections.active_connections(),
                "drain timeout reached, dropping open connections"
            ),
        }
        info!("action proxy stopped");
        Ok(())
    }
}

/// Handle one inbound request. Never fails: errors become replies.
pub async fn handle_request(
    req: Request<Incoming>,
    state: &ProxyState,
    max_body_size: usize,
) -> Response<Full<Bytes>> {
    let route = match Route::resolve(req.method(), req.uri().path()) {
        Ok(route) => route,
        Err(status) => {
            let message = format!("{} {} is not served", req.method(), req.uri().path());
            return error_response(status, &ErrorResponse::new(message));
        }
    };

    let activation_id = uuid::Uuid::now_v7();
    let span = tracing::info_span!(
        "invocation",
        activation_id = %activation_id,
        route = route.as_str(),
    );

    async move {
        let start = Instant::now();
        let body = match read_body(req.into_body(), max_body_size).await {
            Ok(body) => body,
            Err(e) => return failure(route, &e),
        };

        let response = match route {
            Route::Init => init(state, &body).await,
            Route::Run => run(state, &body).await,
        };

        info!(
            status = response.status().as_u16(),
            duration_ms = start.elapsed().as_millis(),
            "invocation completed"
        );
        response
    }
    .instrument(span)
    .await
}

async fn read_body(body: Incoming, limit: usize) -> ProxyResult<Bytes> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ProxyError::PayloadTooLarge { limit })
        }
        Err(e) => Err(ProxyError::config(format!("failed to read request body: {e}"))),
    }
}

async fn init(state: &ProxyState, body: &[u8]) -> Response<Full<Bytes>> {
    let result = match serde_json::from_slice::<Envelope<InitParams>>(body) {
        Ok(envelope) => handle_init(state, envelope.value).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(reply) => json_response(StatusCode::OK, &reply),
        Err(e) => failure(Route::Init, &e),
    }
}

async fn run(state: &ProxyState, body: &[u8]) -> Response<Full<Bytes>> {
    let result = match serde_json::from_slice::<Envelope<Map<String, Value>>>(body) {
        Ok(envelope) => handle_run(state, &envelope.value).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(reply) => {
            let response = json_response(StatusCode::OK, &reply);
            emit_activation_marker();
            response
        }
        Err(e) => {
            metrics::counter!("action_proxy_run_errors_total", "category" => e.category())
                .increment(1);
            failure(Route::Run, &e)
        }
    }
}

fn failure(route: Route, err: &ProxyError) -> Response<Full<Bytes>> {
    match err {
        ProxyError::Spawn { message } => {
            error!(route = route.as_str(), detail = %message, "application failed to launch");
        }
        ProxyError::ReadinessFailure { exit_code } => {
            error!(route = route.as_str(), exit_code, "application exited before it was ready");
        }
        _ if err.status_code() >= 500 => {
            error!(route = route.as_str(), error = %err, category = err.category(), "invocation failed");
        }
        _ => warn!(route = route.as_str(), error = %err, category = err.category(), "invocation rejected"),
    }

    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    error_response(status, &ErrorResponse::from(err))
}

/// Create a JSON response.
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());

    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Create a `{"error": ...}` response.
fn error_response(status: StatusCode, error: &ErrorResponse) -> Response<Full<Bytes>> {
    json_response(status, error)
}
