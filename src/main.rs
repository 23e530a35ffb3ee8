//! Trade Mirror
//!
//! Mirrors every trade placed on a master brokerage account onto one or more
//! follower accounts, sized by a copy ratio and a per-trade stake cap.

mod db;
mod error;
mod events;
mod models;
mod session;
mod trading;
mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use crate::db::{Database, OutcomeStore};
use crate::models::OutcomeLog;
use crate::trading::{Coordinator, CopyState, EngineConfig, StartRequest};
use crate::transport::{WsTransport, WsTransportConfig, DEFAULT_WS_URL};

/// Trade mirroring CLI.
#[derive(Parser)]
#[command(name = "trademirror")]
#[command(about = "Mirror trades from a master account onto follower accounts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./trademirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Engine configuration file (JSON); defaults are used for missing keys
    #[arg(short, long, env = "TRADEMIRROR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start mirroring until Ctrl+C
    Run {
        /// Master account token
        #[arg(short, long, env = "MASTER_TOKEN", hide_env_values = true)]
        master: Option<String>,

        /// Follower as `name=token` or a bare token (repeatable)
        #[arg(
            short,
            long = "follower",
            env = "FOLLOWER_TOKENS",
            value_delimiter = ',',
            hide_env_values = true
        )]
        followers: Vec<String>,

        /// WebSocket endpoint
        #[arg(long, env = "TRADEMIRROR_WS_URL", default_value = DEFAULT_WS_URL)]
        endpoint: String,

        /// Continue a previous session without replaying its trades
        #[arg(long)]
        resume: Option<Uuid>,

        /// Print audit events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show or change the replication policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// List recent copying sessions
    Sessions {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show the outcome log of a session
    History {
        session: Uuid,
    },

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum PolicyAction {
    Show,

    /// Change the copy ratio and/or the stake cap
    Set {
        #[arg(short, long)]
        ratio: Option<Decimal>,

        #[arg(short, long)]
        max_stake: Option<Decimal>,
    },

    /// Allow mirroring for symbols
    Enable { symbols: Vec<String> },

    /// Stop mirroring symbols
    Disable { symbols: Vec<String> },

    /// Restore the default policy
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine_config = load_engine_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            master,
            followers,
            endpoint,
            resume,
            json,
        } => {
            let db = Arc::new(Database::new(&cli.database).await?);
            let policy = db.load_policy().await?.unwrap_or_default();

            let transport = Arc::new(WsTransport::new(WsTransportConfig {
                url: endpoint.clone(),
                ..WsTransportConfig::default()
            }));
            let handle = Coordinator::spawn(transport, db.clone(), engine_config, policy.clone());

            let mut audit = handle.subscribe();
            let printer = tokio::spawn(async move {
                loop {
                    match audit.recv().await {
                        Ok(event) if json => match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!(error = %e, "Failed to encode audit event"),
                        },
                        Ok(event) => println!(
                            "{} #{:<5} {}",
                            event.at.format("%H:%M:%S%.3f"),
                            event.seq,
                            event.kind
                        ),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Audit printer fell behind")
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            println!("\n=== Trade Mirror ===");
            println!("Endpoint:   {}", endpoint);
            println!("Copy ratio: {}", policy.copy_ratio);
            println!("Max stake:  {}", policy.max_stake);
            println!(
                "Symbols:    {}",
                policy.enabled_symbols().collect::<Vec<_>>().join(", ")
            );
            println!("Followers:  {}", followers.len());
            println!();

            let request = StartRequest {
                master,
                followers,
                policy: None,
                resume,
            };
            let report = match handle.start(request).await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Failed to start copying");
                    let _ = handle.stop().await;
                    printer.abort();
                    return Err(anyhow::Error::new(e).context("Failed to start copying"));
                }
            };

            println!("Session:    {}", report.session_id);
            println!(
                "Authorized: {}",
                report
                    .authorized
                    .iter()
                    .map(|a| a.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            if !report.degraded.is_empty() {
                println!(
                    "Degraded:   {}",
                    report
                        .degraded
                        .iter()
                        .map(|a| a.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            println!("\nPress Ctrl+C to stop.\n");

            let mut state = handle.watch_state();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = state.wait_for(|s| *s == CopyState::Error) => {
                    error!("Master session lost, stopping");
                }
            }

            let stopped = handle.stop().await?;
            let snapshot = handle.snapshot().await?;
            printer.abort();

            println!("\n=== Session {} ===", report.session_id);
            println!("Outcomes:   {}", snapshot.outcomes.total());
            println!("Sent:       {}", snapshot.outcomes.sent);
            println!("Suppressed: {}", snapshot.outcomes.suppressed);
            println!("Failed:     {}", snapshot.outcomes.failed);
            if stopped.cancelled > 0 || stopped.forced > 0 {
                println!(
                    "Shutdown:   {} order(s) cancelled, {} session(s) force-closed",
                    stopped.cancelled, stopped.forced
                );
            }
        }

        Commands::Policy { action } => {
            let db = Arc::new(Database::new(&cli.database).await?);
            let current = db.load_policy().await?.unwrap_or_default();

            // Go through an idle coordinator so edits get the same validation
            // as the running engine
            let transport = Arc::new(WsTransport::new(WsTransportConfig::default()));
            let handle = Coordinator::spawn(transport, db.clone(), engine_config, current.clone());

            let policy = match action {
                PolicyAction::Show => current,
                PolicyAction::Set { ratio, max_stake } => {
                    if ratio.is_none() && max_stake.is_none() {
                        anyhow::bail!("Nothing to change; pass --ratio and/or --max-stake");
                    }
                    let mut policy = current;
                    if let Some(ratio) = ratio {
                        policy = handle.set_copy_ratio(ratio).await?;
                    }
                    if let Some(max_stake) = max_stake {
                        policy = handle.set_max_stake(max_stake).await?;
                    }
                    policy
                }
                PolicyAction::Enable { symbols } | PolicyAction::Disable { symbols }
                    if symbols.is_empty() =>
                {
                    anyhow::bail!("No symbols given");
                }
                PolicyAction::Enable { symbols } => {
                    let mut policy = current;
                    for symbol in &symbols {
                        policy = handle.set_symbol_enabled(symbol, true).await?;
                    }
                    policy
                }
                PolicyAction::Disable { symbols } => {
                    let mut policy = current;
                    for symbol in &symbols {
                        policy = handle.set_symbol_enabled(symbol, false).await?;
                    }
                    policy
                }
                PolicyAction::Reset => handle.set_policy(Default::default()).await?,
            };

            println!("\n=== Replication Policy ===\n");
            println!("  Copy Ratio:  {}", policy.copy_ratio);
            println!("  Max Stake:   {}", policy.max_stake);
            println!("\n  {:<16} {:>8}", "SYMBOL", "ENABLED");
            println!("  {}", "-".repeat(25));
            if policy.symbol_enabled.is_empty() {
                println!("  (no symbols; every trade will be suppressed)");
            }
            for (symbol, enabled) in &policy.symbol_enabled {
                println!(
                    "  {:<16} {:>8}",
                    truncate(symbol, 16),
                    if *enabled { "yes" } else { "no" }
                );
            }
        }

        Commands::Sessions { limit } => {
            let db = Database::new(&cli.database).await?;
            let sessions = db.list_sessions(limit).await?;

            if sessions.is_empty() {
                println!("No sessions yet. Use 'trademirror run' to start one.");
                return Ok(());
            }

            println!(
                "\n{:<38} {:<20} {:<20} {:>8} {:<24}",
                "SESSION", "STARTED", "STOPPED", "OUTCOMES", "FOLLOWERS"
            );
            println!("{}", "-".repeat(114));
            for session in sessions {
                println!(
                    "{:<38} {:<20} {:<20} {:>8} {:<24}",
                    session.id,
                    truncate(&session.started_at, 19),
                    session
                        .stopped_at
                        .as_deref()
                        .map(|s| truncate(s, 19))
                        .unwrap_or_else(|| "running".to_string()),
                    session.outcome_count,
                    truncate(&session.followers, 24)
                );
            }
        }

        Commands::History { session } => {
            let db = Database::new(&cli.database).await?;
            let rows = db.outcome_history(session).await?;

            if rows.is_empty() {
                println!("No outcomes recorded for session {}", session);
                return Ok(());
            }

            println!(
                "\n{:>6} {:<20} {:<14} {:<11} {:>10} {:<30}",
                "SEQ", "TRADE", "FOLLOWER", "STATUS", "AMOUNT", "DETAIL"
            );
            println!("{}", "-".repeat(96));
            for row in &rows {
                let detail = row
                    .reason
                    .as_deref()
                    .or(row.reference.as_deref())
                    .unwrap_or("");
                println!(
                    "{:>6} {:<20} {:<14} {:<11} {:>10} {:<30}",
                    row.seq,
                    truncate(&row.trade_id, 20),
                    truncate(&row.follower, 14),
                    row.status,
                    row.amount.as_deref().unwrap_or("-"),
                    truncate(detail, 30)
                );
            }

            let tally = OutcomeLog::from_entries(db.load_outcomes(session).await?).tally();
            println!(
                "\nLatest per trade/follower: {} sent, {} suppressed, {} failed, {} pending",
                tally.sent, tally.suppressed, tally.failed, tally.pending
            );
        }

        Commands::Config => {
            let ws = WsTransportConfig::default();

            println!("\n=== Engine Configuration ===\n");
            println!("Timeouts:");
            println!("  Authorize:            {}ms", engine_config.auth_timeout_ms);
            println!("  Order Send:           {}ms", engine_config.send_timeout_ms);
            println!("  Shutdown:             {}ms", engine_config.shutdown_timeout_ms);

            println!("\nReconnect:");
            println!("  Base Delay:           {}ms", engine_config.reconnect_base_delay_ms);
            println!("  Max Delay:            {}ms", engine_config.reconnect_max_delay_ms);
            println!("  Max Attempts:         {}", engine_config.max_reconnect_attempts);

            println!("\nChannels:");
            println!("  Audit Capacity:       {}", engine_config.event_capacity);
            println!("  Channel Capacity:     {}", engine_config.channel_capacity);

            println!("\n=== WebSocket Transport ===\n");
            println!("  Endpoint:             {}", ws.url);
            println!("  Connect Timeout:      {}ms", ws.connect_timeout_ms);
            println!("  Ping Interval:        {}s", ws.ping_interval_secs);
            println!("  Default Currency:     {}", ws.default_currency);

            println!("\nCredentials are read from --master/--follower or MASTER_TOKEN/FOLLOWER_TOKENS.");
        }
    }

    Ok(())
}

fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Truncate a string for table display.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
