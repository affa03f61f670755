//! # k8mq-broker
//!
//! Runs the k8mq broker as a single pod: loads config, serves the que and
//! status routes, and shuts down cleanly on a termination signal.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};
use k8mq_core::logging::{init_json_subscriber, init_subscriber, level_for_verbosity};
use k8mq_server::metrics::install_recorder;
use k8mq_server::{QueServer, SERVICE_NAME, banner, load_config};
use tracing::{error, info, warn};

/// k8mq broker.
#[derive(Parser, Debug)]
#[command(name = "k8mq-broker", version, about = "K8MQ Server")]
struct Cli {
    /// JSON config file (falls back to `$CONFIG`).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity; repeat for more (-v warn, -vv info, -vvv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Port for the que and status routes.
    #[arg(short = 'p', long = "wssport", alias = "port")]
    port: Option<u16>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Emit logs as one JSON object per line.
    #[arg(long)]
    json_logs: bool,

    /// `help` or `version`.
    command: Vec<String>,
}

/// What the positional arguments asked for.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Help,
    Version,
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args.first().map(|a| a.to_ascii_lowercase()).as_deref() {
        None => Ok(Command::Serve),
        Some("help") => Ok(Command::Help),
        Some("version") => Ok(Command::Version),
        Some(other) => bail!("unknown command line argument '{other}', see `help`"),
    }
}

/// Resolves on the first SIGINT, SIGTERM, SIGHUP or SIGQUIT.
#[cfg(unix)]
async fn termination_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut int = signal(SignalKind::interrupt()).context("SIGINT handler")?;
    let mut term = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut hup = signal(SignalKind::hangup()).context("SIGHUP handler")?;
    let mut quit = signal(SignalKind::quit()).context("SIGQUIT handler")?;
    let name = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = term.recv() => "SIGTERM",
        _ = hup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn termination_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    Ok("ctrl-c")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match parse_command(&cli.command)? {
        Command::Serve => {}
        Command::Help => {
            Cli::command().print_help()?;
            return Ok(());
        }
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    }

    let level = level_for_verbosity(cli.verbose);
    if cli.json_logs {
        init_json_subscriber(level);
    } else {
        init_subscriber(level);
    }

    let mut config = load_config(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    config.validate().context("Invalid config")?;
    let shutdown_timeout = config.shutdown_timeout();

    let mut server = QueServer::new(config).context("Failed to create server")?;
    match install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!(error = %e, "metrics recorder not installed"),
    }

    let addr = server.listen().await.context("Failed to bind")?;
    info!(%addr, version = env!("CARGO_PKG_VERSION"), "{} started", banner());

    let signal = termination_signal().await?;
    info!(signal, "termination signal received, shutting down");

    server.send_shutdown().await;
    if let Err(e) = server.close(shutdown_timeout).await {
        error!(error = %e, "{SERVICE_NAME} did not shut down cleanly");
    }
    info!("exiting");
    Ok(())
}
