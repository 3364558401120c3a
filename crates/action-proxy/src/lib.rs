//! Action proxy: serve `init`/`run` invocations from a plain HTTP application.
//!
//! The proxy sits next to an HTTP application and translates the invoker's
//! two calls into ordinary HTTP:
//!
//! ```text
//!   invoker                  action-proxy                    application
//!  ─────────  POST /init  ─►  unpack bundle,
//!                             record launch command
//!  ─────────  POST /run   ─►  launch once, wait for       ─►  GET /hello?x=1
//!                             liveness, forward request   ◄─  200 "hi"
//!            ◄─ {statusCode, headers, body}
//! ```
//!
//! The first `run` races a liveness poll against the exit of the launched
//! process. The race runs once per process lifetime and every caller sees
//! its outcome: once the application answered, the proxy never polls again;
//! if the process died first, every later call fails with
//! `application process is not running`.
//!
//! # Example Usage
//!
//! ```bash
//! # Application already started by the container entrypoint
//! $ PROXY_PORT=3000 action-proxy
//!
//! # With a configuration file
//! $ action-proxy --config /etc/action-proxy.toml
//! ```

#![doc(html_root_url = "https://docs.rs/action-proxy/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod archive;
pub mod codec;
pub mod config;
pub mod error;
pub mod forward;
pub mod init;
pub mod invocation;
pub mod readiness;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod telemetry;

pub use config::{ProxyConfig, SidecarConfig, SidecarConfigBuilder};
pub use error::{ProxyError, ProxyResult};
pub use invocation::{InitParams, InitReply, RunParams, RunReply};
pub use readiness::{ReadinessCoordinator, ReadinessOutcome, ReadinessState};
pub use server::SidecarServer;
pub use shutdown::ShutdownSignal;
pub use state::ProxyState;
pub use supervisor::{AppLaunchSpec, ProcessOutcome, ProcessSupervisor};

/// Proxy version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
