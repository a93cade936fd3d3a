use tracing_subscriber::EnvFilter;
use wayfarer_agent::LaunchOptions;
use wayfarer_runner::TaskSettings;
use wayfarer_tools::WayfarerServer;

/// MCP server over stdio. Stdout carries the protocol, so logs go to stderr.
///
/// Environment:
/// - `WAYFARER_HEADLESS=false` shows the browser window.
/// - `WAYFARER_SETTINGS=path.yaml` loads task settings.
/// - `RUST_LOG` sets the log filter (default `warn`).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let launch = LaunchOptions {
        headless: std::env::var("WAYFARER_HEADLESS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true),
        ..Default::default()
    };
    let settings: TaskSettings = match std::env::var("WAYFARER_SETTINGS") {
        Ok(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
        Err(_) => TaskSettings::default(),
    };

    wayfarer_tools::mcp::run_server(WayfarerServer::with_settings(launch, settings)).await
}
