//! AUTOMINE: autonomous risk-managed mining controller for refinORE.
//!
//! Entry point. Loads configuration, initialises structured logging, and
//! either runs the controller loop (`run`) or issues a one-shot command
//! against the backend.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use automine::config::{AppConfig, MissingCredential, SessionDefaults};
use automine::controller::{MiningController, RunOutcome};
use automine::dashboard::{spawn_dashboard, DashboardState};
use automine::error::{ApiError, ControllerError, ErrorKind};
use automine::ingest::EventIngestor;
use automine::storage::LedgerStore;
use automine::transport::{MiningApi, RefinoreClient, RetryPolicy};
use automine::types::{MiningToken, RiskTolerance, SessionConfig};

const BANNER: &str = r#"
   __ _ _   _| |_ ___  _ __ ___ (_)_ __   ___
  / _` | | | | __/ _ \| '_ ` _ \| | '_ \ / _ \
 | (_| | |_| | || (_) | | | | | | | | | |  __/
  \__,_|\__,_|\__\___/|_| |_| |_|_|_| |_|\___|

  risk-managed refinORE mining controller
"#;

/// How long the event ingestor gets to exit after the controller stops.
const INGEST_JOIN: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "automine", version, about = "Autonomous risk-managed refinORE mining")]
struct Cli {
    /// Configuration file. Missing file means defaults.
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start (or adopt) a session and drive it until Ctrl+C.
    Run {
        #[arg(long)]
        sol: Option<Decimal>,
        #[arg(long)]
        tiles: Option<u8>,
        /// `optimal`, `random`, or a comma-separated tile list.
        #[arg(long)]
        strategy: Option<String>,
        #[command(flatten)]
        opts: SessionOpts,
    },
    /// Start a session on the backend and exit.
    Start {
        sol: Decimal,
        tiles: u8,
        /// `optimal`, `random`, or a comma-separated tile list.
        strategy: String,
        #[command(flatten)]
        opts: SessionOpts,
    },
    /// Stop the active session. Succeeds when none is running.
    Stop,
    /// Show the active session.
    Status,
    /// Show wallet balances.
    Balance,
    /// List prior sessions.
    History {
        #[arg(default_value_t = 10)]
        limit: u32,
    },
    /// Show the live round.
    Round,
}

/// Session overrides on top of `[session]`.
#[derive(Args, Default)]
struct SessionOpts {
    #[arg(long)]
    risk: Option<RiskTolerance>,
    #[arg(long)]
    token: Option<MiningToken>,
    /// Minimum EV estimate, in percent.
    #[arg(long)]
    ev_threshold: Option<Decimal>,
    #[arg(long)]
    motherlode_only: bool,
    /// Pause once net P&L falls to minus this many SOL.
    #[arg(long)]
    stop_loss: Option<Decimal>,
    #[arg(long)]
    max_loss_streak: Option<u32>,
    #[arg(long)]
    no_auto_restart: bool,
}

impl SessionOpts {
    fn apply(&self, base: &mut SessionDefaults) {
        if let Some(r) = self.risk {
            base.risk_tolerance = r;
        }
        if let Some(t) = self.token {
            base.mining_token = t;
        }
        if let Some(ev) = self.ev_threshold {
            base.ev_threshold = ev;
        }
        if self.motherlode_only {
            base.motherlode_only = true;
        }
        if self.stop_loss.is_some() {
            base.stop_loss_sol = self.stop_loss;
        }
        if self.max_loss_streak.is_some() {
            base.max_loss_streak = self.max_loss_streak;
        }
        if self.no_auto_restart {
            base.auto_restart = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();
    init_logging();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "automine failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut cfg = AppConfig::load_or_default(&cli.config)?;
    cfg.apply_env();

    match cli.command {
        Command::Run {
            sol,
            tiles,
            strategy,
            opts,
        } => {
            let mut base = cfg.session.clone();
            if let Some(sol) = sol {
                base.sol_per_round = sol;
            }
            if let Some(tiles) = tiles {
                base.num_tiles = tiles;
            }
            if let Some(strategy) = strategy {
                base.strategy = strategy;
            }
            opts.apply(&mut base);
            let session = base.to_session_config()?;
            run_daemon(cfg, session).await
        }
        Command::Start {
            sol,
            tiles,
            strategy,
            opts,
        } => {
            let mut base = cfg.session.clone();
            base.sol_per_round = sol;
            base.num_tiles = tiles;
            base.strategy = strategy;
            opts.apply(&mut base);
            let session = base.to_session_config()?;
            start_once(&cfg, session).await
        }
        Command::Stop => {
            let api = client(&cfg)?;
            match api.stop().await {
                Ok(summary) => println!("Stopped: {summary}"),
                Err(ApiError::NotFound { .. }) => println!("No active session"),
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
        Command::Status => {
            let api = client(&cfg)?;
            match api.current_session().await {
                Ok(s) => {
                    println!("Session {} [{}]", s.session_id, s.status);
                    if let Some(sol) = s.sol_per_round {
                        println!("  sol/round:  {sol}");
                    }
                    if let Some(n) = s.num_tiles {
                        println!("  tiles:      {n} ({})", s.tile_mode.as_deref().unwrap_or("?"));
                    }
                    if let Some(ids) = &s.tile_ids {
                        println!("  tile ids:   {ids:?}");
                    }
                    if let Some(t) = s.mining_token {
                        println!("  token:      {t}");
                    }
                    if let Some(at) = s.started_at {
                        println!("  started at: {at}");
                    }
                }
                Err(ApiError::NotFound { .. }) => println!("No active session"),
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
        Command::Balance => {
            let api = client(&cfg)?;
            let balances = api.balances().await?;
            for token in MiningToken::ALL {
                let amount = balances.amount(*token);
                match balances.quote(*token) {
                    Some(q) if *token != MiningToken::Sol => {
                        println!("{:>6}  {amount}  (~{} SOL)", token.as_str(), amount * q)
                    }
                    _ => println!("{:>6}  {amount}", token.as_str()),
                }
            }
            Ok(())
        }
        Command::History { limit } => {
            let api = client(&cfg)?;
            let sessions = api.history(limit).await?;
            if sessions.is_empty() {
                println!("No prior sessions");
            }
            for s in sessions {
                let started = s.started_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                println!(
                    "{}  {}  {} rounds  net {} SOL",
                    s.session_id, started, s.rounds_played, s.net_pnl_sol
                );
            }
            Ok(())
        }
        Command::Round => {
            let api = client(&cfg)?;
            let round = api.current_round().await?;
            println!("{round}");
            Ok(())
        }
    }
}

fn client(cfg: &AppConfig) -> Result<RefinoreClient> {
    let credentials = cfg.credentials()?;
    RefinoreClient::from_config(&cfg.api, credentials, RetryPolicy::from(&cfg.retry))
        .context("Failed to build API client")
}

/// `start`: go through the controller so adoption and conflict checks
/// apply, then leave the backend session running.
async fn start_once(cfg: &AppConfig, session: SessionConfig) -> Result<()> {
    let api: Arc<dyn MiningApi> = Arc::new(client(cfg)?);
    let mut controller = MiningController::new(api, cfg.controller.clone());
    let handle = controller.start(session).await?;
    println!("Session {} [{}]", handle.session_id, handle.status);
    Ok(())
}

async fn run_daemon(cfg: AppConfig, session: SessionConfig) -> Result<()> {
    println!("{BANNER}");
    info!(
        base_url = %cfg.api.base_url,
        session = %session,
        data_dir = %cfg.storage.data_dir,
        "AUTOMINE starting up"
    );

    let retry = RetryPolicy::from(&cfg.retry);
    let api: Arc<dyn MiningApi> = Arc::new(client(&cfg)?);
    let store = LedgerStore::new(&cfg.storage.data_dir);
    let mut controller =
        MiningController::new(api.clone(), cfg.controller.clone()).with_store(store);

    if cfg.status.enabled {
        let addr: SocketAddr = format!("{}:{}", cfg.status.bind, cfg.status.port)
            .parse()
            .context("Invalid status endpoint address")?;
        let state = Arc::new(DashboardState::new(controller.status_handle()));
        spawn_dashboard(state, addr).await?;
    }

    let handle = controller.start(session).await?;
    info!(session_id = %handle.session_id, "Session running. Press Ctrl+C to stop.");

    // The ingestor keeps running until the controller has drained.
    let (ctl_tx, ctl_rx) = watch::channel(false);
    let (ingest_tx, ingest_rx) = watch::channel(false);
    let (mut events, mut ingest_task) =
        EventIngestor::spawn(api, cfg.ingest.clone(), retry, ingest_rx);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = ctl_tx.send(true);
        }
    });

    let outcome = controller.run(&mut events, ctl_rx).await;

    // `run` is bounded by the grace period; the ingestor gets a short join.
    let _ = ingest_tx.send(true);
    drop(events);
    match timeout(INGEST_JOIN, &mut ingest_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Event ingestor task ended abnormally"),
        Err(_) => {
            warn!("Event ingestor did not stop in time; aborting it");
            ingest_task.abort();
        }
    }

    let agg = controller.ledger().aggregates();
    info!(
        state = %controller.state(),
        rounds = agg.rounds,
        wins = agg.win_count,
        net_pnl_sol = %agg.net_pnl_sol,
        ore_earned = %agg.ore_earned,
        "AUTOMINE shut down"
    );

    match outcome {
        RunOutcome::Faulted(fault) => Err(ControllerError::Faulted {
            kind: fault.kind,
            message: fault.message,
        }
        .into()),
        RunOutcome::Shutdown | RunOutcome::SourceClosed => Ok(()),
    }
}

/// 2 for authentication failures, 1 for anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    let auth = err.downcast_ref::<MissingCredential>().is_some()
        || err
            .downcast_ref::<ApiError>()
            .is_some_and(|e| e.kind() == ErrorKind::AuthExpired)
        || err
            .downcast_ref::<ControllerError>()
            .is_some_and(|e| e.kind() == Some(ErrorKind::AuthExpired));
    if auth {
        2
    } else {
        1
    }
}

/// Initialise the tracing subscriber. `RUST_LOG` overrides the default
/// filter; `AUTOMINE_LOG_JSON` switches to JSON lines.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("automine=info"));

    let json_logging = std::env::var("AUTOMINE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
