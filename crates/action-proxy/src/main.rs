//! Action proxy entry point.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{error, info};

use action_proxy::{telemetry, SidecarConfig, SidecarServer};

/// Command-line arguments.
struct Args {
    /// Path to configuration file.
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = args.next().map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("action-proxy {}", action_proxy::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { config }
    }
}

fn print_help() {
    println!(
        r"action-proxy - serve init/run invocations from an HTTP application

USAGE:
    action-proxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML or JSON)
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT VARIABLES:
    PROXY_HOST             Application host (default: localhost)
    PROXY_PORT             Application port (default: 80)
    PROXY_ALIVE_PATH       Liveness path (default: /)
    PROXY_ALIVE_DELAY      Delay between liveness probes in ms (default: 100)
    PROXY_PROTOCOL         http or https (default: http)
    PROXY_ALIVE_TIMEOUT    Give up waiting for the application after ms (default: never)
    PROXY_APP_DIR          Bundle extraction directory (default: action)
    PROXY_LISTEN_PORT      Invocation port (default: 8080)
    PROXY_MAX_BODY_SIZE    Invocation payload limit in bytes (default: 50331648)
    PROXY_LOG_FORMAT       json or pretty (default: json)
    RUST_LOG               Log filter (default: action_proxy=info,warn)

EXAMPLES:
    # Proxy to an application started by the container entrypoint
    PROXY_PORT=3000 action-proxy

    # Run with a configuration file
    action-proxy --config /etc/action-proxy.toml
"
    );
}

fn load_config(args: &Args) -> anyhow::Result<SidecarConfig> {
    let config = match &args.config {
        Some(path) => SidecarConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => SidecarConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn serve(config: SidecarConfig) -> anyhow::Result<()> {
    let server = SidecarServer::bind(config)
        .await
        .context("failed to start server")?;
    server.run().await.context("server error")
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = telemetry::init_logging(&config.logging) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    info!(
        version = action_proxy::VERSION,
        listen_port = config.server.listen_port,
        target_url = %config.proxy.base_url(),
        "starting action proxy"
    );

    if let Err(e) = serve(config).await {
        error!(error = format!("{e:#}"), "action proxy failed");
        std::process::exit(1);
    }
}
