//! Typed views of the `init` and `run` payloads.
//!
//! Both calls carry a JSON document of the form `{"value": {...}}`. The
//! `run` parameters use reserved `__ow_` names; anything else in `value`
//! is ignored.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ProxyOverrides;
use crate::error::{ProxyError, ProxyResult};

/// Prefix of environment overrides on a `run` call.
pub const ENV_OVERRIDE_PREFIX: &str = "__ow_proxy_env_";

/// Envelope shared by both calls.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    /// Call parameters.
    pub value: T,
}

/// Parameters of an `init` call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InitParams {
    /// Whether `code` holds a bundled application archive.
    pub binary: bool,
    /// Base64-encoded archive.
    pub code: Option<String>,
    /// Command line launching the bundled application.
    pub main: Option<String>,
    /// Environment given to the application when it is launched.
    pub env: Map<String, Value>,
}

impl InitParams {
    /// Whether this call carries a bundle to extract and launch.
    pub fn has_bundle(&self) -> bool {
        self.binary && self.code.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// `env` flattened to string pairs.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()
    }
}

/// Acknowledgement returned by a successful `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitReply {
    /// Always `true`.
    pub ok: bool,
}

impl InitReply {
    /// Successful acknowledgement.
    pub const OK: Self = Self { ok: true };
}

/// Parameters of a `run` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParams {
    /// HTTP method as sent by the caller (usually lowercase).
    pub method: String,
    /// Request headers, `host` already removed.
    pub headers: BTreeMap<String, String>,
    /// Request path.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: String,
    /// Raw body string, base64 or text.
    pub body: Option<String>,
    /// `__ow_proxy_debug`.
    pub debug: bool,
    /// `__ow_proxy_*` config overrides.
    pub overrides: ProxyOverrides,
    /// `__ow_proxy_env_<NAME>` overrides, in name order.
    pub env: Vec<(String, String)>,
}

impl RunParams {
    /// Parse the `value` object of a `run` call.
    pub fn from_value(value: &Map<String, Value>) -> ProxyResult<Self> {
        let method = match value.get("__ow_method") {
            Some(Value::String(m)) if !m.is_empty() => m.clone(),
            Some(_) => return Err(ProxyError::config("__ow_method must be a string")),
            None => return Err(ProxyError::config("missing __ow_method")),
        };

        let mut headers = BTreeMap::new();
        match value.get("__ow_headers") {
            Some(Value::Object(map)) => {
                for (name, v) in map {
                    if !name.eq_ignore_ascii_case("host") {
                        headers.insert(name.clone(), value_to_string(v));
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => return Err(ProxyError::config("__ow_headers must be an object")),
        }

        let path = optional_string(value, "__ow_path")?
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let query = optional_string(value, "__ow_query")?.unwrap_or_default();
        let body = optional_string(value, "__ow_body")?;
        let debug = value.get("__ow_proxy_debug").is_some_and(is_truthy);

        let overrides = ProxyOverrides {
            host: optional_string(value, "__ow_proxy_host")?,
            port: optional_number(value, "__ow_proxy_port")?
                .map(|p| {
                    u16::try_from(p)
                        .map_err(|_| ProxyError::config(format!("__ow_proxy_port out of range: {p}")))
                })
                .transpose()?,
            alive_path: optional_string(value, "__ow_proxy_alive_path")?,
            alive_delay: optional_number(value, "__ow_proxy_alive_delay")?
                .map(Duration::from_millis),
            protocol: optional_string(value, "__ow_proxy_protocol")?
                .map(|p| p.parse())
                .transpose()?,
        };

        let env = value
            .iter()
            .filter_map(|(key, v)| {
                key.strip_prefix(ENV_OVERRIDE_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), value_to_string(v)))
            })
            .collect();

        Ok(Self {
            method,
            headers,
            path,
            query,
            body,
            debug,
            overrides,
            env,
        })
    }
}

/// Reply of a successful `run` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReply {
    /// Upstream status code.
    pub status_code: u16,
    /// Upstream headers; repeated headers keep every value.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Text body verbatim, or base64 of a binary body.
    pub body: String,
}

fn optional_string(value: &Map<String, Value>, key: &str) -> ProxyResult<Option<String>> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProxyError::config(format!("{key} must be a string"))),
    }
}

fn optional_number(value: &Map<String, Value>, key: &str) -> ProxyResult<Option<u64>> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ProxyError::config(format!("{key} must be a non-negative integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProxyError::config(format!("{key} must be a non-negative integer"))),
        Some(_) => Err(ProxyError::config(format!("{key} must be a number"))),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
