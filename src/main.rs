use anyhow::Context;
use cacheproxy::config::Config;
use cacheproxy::server::CacheProxyServer;
use cacheproxy::server::stats::spawn_reporter;
use cacheproxy::server::listener::STATS_REPORT_INTERVAL;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `proxy <port>` is the literal CLI contract this binary must preserve: a
/// missing or extra positional argument prints usage to stdout and exits
/// non-zero, independent of whatever clap would otherwise do with its
/// derive-generated error path (which writes to stderr).
#[derive(Parser, Debug)]
#[command(name = "proxy", disable_help_flag = false)]
struct Args {
    port: Option<u16>,

    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

const USAGE: &str = "usage: proxy <port> [--config <file>] [--log-level <level>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let raw_args: Vec<String> = std::env::args().collect();
    let positional_count = raw_args
        .iter()
        .skip(1)
        .take_while(|a| !a.starts_with("--"))
        .count();

    if positional_count != 1 {
        println!("{USAGE}");
        std::process::exit(2);
    }

    let args = Args::parse();
    let Some(port) = args.port else {
        println!("{USAGE}");
        std::process::exit(2);
    };

    init_logging(&args.log_level)?;

    info!("cacheproxy v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load(port, args.config.as_deref())
        .context("failed to load configuration")?;

    let server = CacheProxyServer::new(config);
    let shutdown = CancellationToken::new();

    let stats_handle = spawn_reporter(
        server.stats(),
        server.cache(),
        STATS_REPORT_INTERVAL,
        shutdown.clone(),
    );

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal");
        signal_shutdown.cancel();
    });

    server
        .run(shutdown)
        .await
        .context("server loop exited with an error")?;

    let _ = stats_handle.await;
    info!("shutdown complete");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(level).context("invalid log level")?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
