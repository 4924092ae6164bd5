//! Greenhouse climate control binary
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use verdant::components::prelude::*;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Climate Control Component.
    #[arg(short, long)]
    filepath: String,
    /// Log level used when RUST_LOG does not say otherwise.
    #[arg(short, long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(args.log_level, &directives))
        .with_target(false)
        .init();

    let component = ClimateControl::from_config_file(&args.filepath)
        .with_context(|| format!("failed to start climate control from {}", args.filepath))?;
    ClimateControlController::start(component, shutdown_signal()).await;
    Ok(())
}

/// Log filter from `RUST_LOG` style directives, falling back to `default`
/// when they name no level.
fn env_filter(default: tracing::Level, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(default).into())
        .parse_lossy(directives)
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown requested");
}

#[cfg(test)]
mod tests {

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(tracing::Level::INFO, "", LevelFilter::INFO)]
    #[case(tracing::Level::WARN, "", LevelFilter::WARN)]
    #[case(tracing::Level::INFO, "debug", LevelFilter::DEBUG)]
    #[case(tracing::Level::INFO, "trace", LevelFilter::TRACE)]
    #[case(tracing::Level::INFO, "error", LevelFilter::ERROR)]
    fn test_rust_log_overrides_default_level(
        #[case] default: tracing::Level,
        #[case] directives: &str,
        #[case] expected: LevelFilter,
    ) {
        assert_eq!(env_filter(default, directives).max_level_hint(), Some(expected));
    }

    #[test]
    fn test_rust_log_debug_enables_debug_events() {
        use tracing_subscriber::layer::SubscriberExt;

        let subscriber =
            tracing_subscriber::registry().with(env_filter(tracing::Level::INFO, "debug"));
        let enabled = tracing::subscriber::with_default(subscriber, || {
            tracing::enabled!(tracing::Level::DEBUG)
        });
        assert!(enabled);
    }
}
