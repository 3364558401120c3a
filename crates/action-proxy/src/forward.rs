//! Forwarding of `run` calls to the application.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use reqwest::{Client, Url};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::codec;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::invocation::{RunParams, RunReply};
use crate::state::ProxyState;

/// Line printed once a `run` reply is produced.
pub const ACTIVATION_MARKER: &str = "XXX_THE_END_OF_A_WHISK_ACTIVATION_XXX";

/// Request to be sent to the application.
#[derive(Debug)]
pub struct OutboundRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute target URL.
    pub url: Url,
    /// Request headers, without `host`.
    pub headers: HeaderMap,
    /// Decoded request body.
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    /// Translate `run` parameters into an outbound request against `config`.
    pub fn build(params: &RunParams, config: &ProxyConfig) -> ProxyResult<Self> {
        let method = Method::from_bytes(params.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ProxyError::config(format!("invalid method: {}", params.method)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &params.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ProxyError::config(format!("invalid header name: {name}")))?;
            if name == http::header::HOST {
                continue;
            }
            let value = HeaderValue::from_str(value).map_err(|_| {
                ProxyError::config(format!("invalid value for header {name}"))
            })?;
            headers.append(name, value);
        }

        let body = params
            .body
            .as_deref()
            .filter(|b| !b.is_empty() && codec::can_have_body(&params.method))
            .map(|raw| Bytes::from(codec::decode_request_body(raw)));

        Ok(Self {
            method,
            url: target_url(config, &params.path, &params.query)?,
            headers,
            body,
        })
    }

    /// Send the request and translate the response into a reply.
    pub async fn send(self, client: &Client) -> ProxyResult<RunReply> {
        let mut builder = client.request(self.method, self.url).headers(self.headers);
        if let Some(body) = self.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::upstream(format!("request failed: {e}")))?;

        let status_code = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = codec::encode_response(response)
            .await
            .map_err(|e| ProxyError::upstream(format!("failed to read body: {e}")))?;

        Ok(RunReply {
            status_code,
            headers,
            body,
        })
    }
}

/// `protocol://host:port` joined with `path`, with `query` replacing any
/// query embedded in the path.
pub fn target_url(config: &ProxyConfig, path: &str, query: &str) -> ProxyResult<Url> {
    let base = Url::parse(&config.base_url())
        .map_err(|e| ProxyError::config(format!("invalid target {}: {e}", config.base_url())))?;
    let mut url = base
        .join(path)
        .map_err(|e| ProxyError::config(format!("invalid path {path}: {e}")))?;

    if url.origin() != base.origin() {
        return Err(ProxyError::config(format!(
            "path {path} leaves the application origin"
        )));
    }

    let query = query.strip_prefix('?').unwrap_or(query);
    url.set_query((!query.is_empty()).then_some(query));
    Ok(url)
}

/// Response headers keyed by lowercase name, keeping repeated values.
pub fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let value = value.to_str().map_or_else(
            |_| String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ToString::to_string,
        );
        collected
            .entry(name.as_str().to_string())
            .or_default()
            .push(value);
    }
    collected
}

/// Handle one `run` call.
pub async fn handle_run(state: &ProxyState, value: &Map<String, Value>) -> ProxyResult<RunReply> {
    let params = RunParams::from_value(value)?;
    if params.debug {
        let payload = Value::Object(value.clone());
        info!(value = %payload, "run payload");
    }

    let config = state.apply_overrides(&params.overrides);
    state.record_env(&params.env);

    let request = OutboundRequest::build(&params, &config)?;
    state.ensure_ready(&config).await?;

    if params.debug {
        info!(
            method = %request.method,
            url = %request.url,
            headers = ?request.headers,
            body_bytes = request.body.as_ref().map_or(0, Bytes::len),
            "outgoing request"
        );
    } else {
        debug!(method = %request.method, url = %request.url, "forwarding request");
    }

    let reply = request.send(state.client()).await?;

    if params.debug {
        info!(
            status = reply.status_code,
            headers = ?reply.headers,
            body_len = reply.body.len(),
            "incoming response"
        );
    }
    metrics::counter!("action_proxy_runs_total", "status" => reply.status_code.to_string())
        .increment(1);

    Ok(reply)
}

/// Signal the end of an activation to the platform's log collector.
pub fn emit_activation_marker() {
    println!("{ACTIVATION_MARKER}");
    eprintln!("{ACTIVATION_MARKER}");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn run_params(value: Value) -> RunParams {
        let Value::Object(map) = value else {
            panic!("test value must be an object");
        };
        RunParams::from_value(&map).unwrap()
    }

    fn config(port: u16) -> ProxyConfig {
        ProxyConfig {
            port,
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn test_target_url() {
        let url = target_url(&config(9000), "/hello", "x=1").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/hello?x=1");
    }

    #[test]
    fn test_query_replaces_embedded_query() {
        let url = target_url(&config(9000), "/hello?old=1", "new=2").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/hello?new=2");

        let url = target_url(&config(9000), "/hello?old=1", "").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/hello");
    }

    #[test]
    fn test_target_url_stays_on_origin() {
        assert!(target_url(&config(9000), "//elsewhere.example/x", "").is_err());
        assert!(target_url(&config(9000), "http://elsewhere.example/", "").is_err());
    }

    #[test]
    fn test_build_strips_host_and_uppercases_method() {
        let params = run_params(json!({
            "__ow_method": "post",
            "__ow_path": "/items",
            "__ow_headers": {"content-type": "text/plain", "x-trace": "abc"},
            "__ow_body": "hello world"
        }));

        let request = OutboundRequest::build(&params, &config(3000)).unwrap();

        assert_eq!(request.method, Method::POST);
        assert!(request.headers.get("host").is_none());
        assert_eq!(request.headers["x-trace"], "abc");
        assert_eq!(request.body.as_deref(), Some(b"hello world".as_slice()));
    }

    #[test]
    fn test_get_and_head_never_carry_body() {
        for method in ["get", "head", "GET"] {
            let params = run_params(json!({"__ow_method": method, "__ow_body": "aGVsbG8="}));
            let request = OutboundRequest::build(&params, &config(3000)).unwrap();
            assert!(request.body.is_none(), "{method} must not carry a body");
        }
    }

    #[test]
    fn test_base64_body_is_decoded() {
        let params = run_params(json!({"__ow_method": "put", "__ow_body": "AAEC/w=="}));
        let request = OutboundRequest::build(&params, &config(3000)).unwrap();
        assert_eq!(request.body.as_deref(), Some([0x00, 0x01, 0x02, 0xff].as_slice()));
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let params = run_params(json!({
            "__ow_method": "get",
            "__ow_headers": {"bad header": "x"}
        }));
        let err = OutboundRequest::build(&params, &config(3000)).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_collect_headers_keeps_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", HeaderValue::from_static("a=1"));
        headers.append("Set-Cookie", HeaderValue::from_static("b=2"));
        headers.insert("Content-Type", HeaderValue::from_static("text/plain"));

        let collected = collect_headers(&headers);
        assert_eq!(collected["set-cookie"], vec!["a=1", "b=2"]);
        assert_eq!(collected["content-type"], vec!["text/plain"]);
    }
}
