//! t2s main binary.

mod agent;
mod config;
mod notifier;
mod routes;
mod sampler;
mod server;
mod sqlite_store;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "t2s", version, about = "Chat-driven remote operations assistant")]
struct Cli {
    /// Config file (default: ~/.t2s/config.toml).
    #[arg(long, global = true, env = "T2S_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the t2s server (default).
    Serve,
    /// Validate config and provider setup.
    Doctor,
    /// Show persisted session and alert state.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Status => server::status(cli.config).await,
    }
}

const DEFAULT_FILTER: &str = "info,t2s_app=debug,t2s_core=debug,t2s_llm=info,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => anyhow::bail!(
                "unsupported T2S_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ),
        }
    }
}

/// Closed spans carry the latency of dispatches, ticks and HTTP requests.
fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format: LogFormat = std::env::var("T2S_LOG_FORMAT")
        .unwrap_or_default()
        .parse()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .init(),
        LogFormat::Pretty => builder.pretty().with_file(true).with_line_number(true).init(),
        LogFormat::Compact => builder.compact().init(),
    }

    tracing::debug!(?format, "tracing initialized");
    Ok(())
}

/// Routes panics inside spawned tasks (dispatch streams, the monitor, the
/// store writer) through the structured log before the default report.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()));
        let thread = std::thread::current();
        tracing::error!(
            thread = thread.name().unwrap_or("unnamed"),
            location = location.as_deref().unwrap_or("unknown"),
            message = panic_message(info.payload()),
            "task panicked"
        );
        default_hook(info);
    }));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
