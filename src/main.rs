use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{AdmissionGateway, GatewayDecision};

/// Per-client sliding-window admission control.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, overrides the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay `<route> <client-key>` lines and print one JSON decision per line
    Replay {
        /// Input file; reads stdin when omitted
        input: Option<PathBuf>,
    },
    /// Print the resolved policy table as JSON
    Policies,
}

/// One replayed request and its outcome.
#[derive(Debug, Serialize)]
struct ReplayRecord<'a> {
    route: &'a str,
    client: &'a str,
    policy: Option<&'a str>,
    admitted: bool,
    code: &'static str,
    limit: Option<u32>,
    remaining: Option<u32>,
    retry_after_ms: u64,
}

impl<'a> ReplayRecord<'a> {
    fn new(route: &'a str, client: &'a str, decision: &'a GatewayDecision) -> Self {
        match decision {
            GatewayDecision::Unthrottled => Self {
                route,
                client,
                policy: None,
                admitted: true,
                code: "unthrottled",
                limit: None,
                remaining: None,
                retry_after_ms: 0,
            },
            GatewayDecision::Checked { policy, decision } => Self {
                route,
                client,
                policy: Some(policy.as_str()),
                admitted: decision.is_admitted(),
                code: decision.code.as_str(),
                limit: Some(decision.limit),
                remaining: Some(decision.remaining),
                retry_after_ms: decision.retry_after.as_millis() as u64,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct PolicyRow<'a> {
    name: &'a str,
    max_requests: u32,
    window_ms: u64,
    routes: &'a [String],
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging, cli.log_level.as_deref(), cli.json_logs)?;

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Policies => print_policies(&config),
        Command::Replay { input } => {
            tokio::select! {
                result = replay(config, input) => result?,
                _ = shutdown_signal() => {
                    info!("Turnstile stopped");
                    // A pending blocking stdin read would keep the runtime alive
                    std::process::exit(0);
                }
            }
            info!("Turnstile stopped");
            Ok(())
        }
    }
}

fn init_tracing(
    logging: &LoggingConfig,
    level_override: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let directive = level_override.unwrap_or(&logging.level);
    let filter = EnvFilter::try_new(directive)
        .with_context(|| format!("invalid log filter '{}'", directive))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(io::stderr);

    if json || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn print_policies(config: &TurnstileConfig) -> anyhow::Result<()> {
    let mut rows = Vec::with_capacity(config.rules.len());
    for rule in &config.rules {
        let policy = rule.policy()?;
        rows.push(PolicyRow {
            name: &rule.name,
            max_requests: policy.max_requests(),
            window_ms: policy.window_millis(),
            routes: &rule.routes,
        });
    }

    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn replay(config: TurnstileConfig, input: Option<PathBuf>) -> anyhow::Result<()> {
    let gateway = AdmissionGateway::new(config.route_rules(), config.controller_options())?;
    let purge_tasks = match config.purge_interval() {
        Some(interval) => gateway.spawn_purge_tasks(interval),
        None => Vec::new(),
    };

    let reader: Box<dyn BufRead + Send> = match &input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    // Reading is blocking; keep it off the runtime workers
    let gateway = tokio::task::spawn_blocking(move || -> anyhow::Result<AdmissionGateway> {
        let stdout = io::stdout();
        let mut out = stdout.lock();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(route), Some(client), None) = (fields.next(), fields.next(), fields.next())
            else {
                warn!(line = index + 1, "Skipping malformed line, expected '<route> <client-key>'");
                continue;
            };

            let decision = gateway.admit(route, client);
            serde_json::to_writer(&mut out, &ReplayRecord::new(route, client, &decision))?;
            writeln!(out)?;
        }

        out.flush()?;
        Ok(gateway)
    })
    .await??;

    for task in purge_tasks {
        task.shutdown().await;
    }
    for rule in &gateway.rules().rules {
        if let Some(controller) = gateway.controller(&rule.name) {
            let stats = controller.stats();
            info!(
                policy = %rule.name,
                admitted = stats.admitted,
                rejected = stats.rejected,
                invalid = stats.invalid,
                evicted = stats.evicted,
                purged = stats.purged,
                tracked = stats.tracked_clients,
                "Replay finished"
            );
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
