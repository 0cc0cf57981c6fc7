use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vigil::config::{AppConfig, LoggingConfig};
use vigil::coordination::install_signal_handlers;
use vigil::persistence::FileStore;
use vigil::services::{control, ControlState, HttpProbe};
use vigil::supervisor::{
    DaemonSupervisor, LogAlertSink, LogRiskControl, RecoveryOrchestrator, RegistrySource,
};
use vigil::{ComponentRegistry, SupervisorContext};

#[derive(Parser)]
#[command(name = "vigil", about = "Process-supervision and disaster-recovery daemon")]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config", env = "VIGIL_CONFIG_DIR")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervision daemon
    Start,
    /// Show aggregate recovery state and per-component health
    Status {
        /// Control server address of the running daemon
        #[arg(long, default_value = "127.0.0.1:7770")]
        addr: String,
    },
    /// Force an immediate checkpoint
    Checkpoint {
        #[arg(long, default_value = "127.0.0.1:7770")]
        addr: String,
    },
    /// Force a recovery sequence
    Recover {
        #[arg(long, default_value = "127.0.0.1:7770")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_daemon(&cli.config_dir).await,
        Commands::Status { addr } => run_status(&addr).await,
        Commands::Checkpoint { addr } => run_checkpoint(&addr).await,
        Commands::Recover { addr } => run_recover(&addr).await,
    }
}

async fn run_daemon(config_dir: &str) -> ExitCode {
    // Exit code 1: fatal startup failure.
    let config = match AppConfig::load_from(config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Configuration error: {}", e);
        }
        return ExitCode::from(1);
    }

    init_logging(&config.logging);

    let store = match FileStore::open(&config.checkpoint.dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Cannot initialize checkpoint store: {}", e);
            return ExitCode::from(1);
        }
    };

    let registry = Arc::new(ComponentRegistry::new());
    let source = Arc::new(RegistrySource::new(registry.clone()));

    let ctx = match SupervisorContext::build(
        config.clone(),
        store,
        source,
        Arc::new(LogAlertSink),
        Arc::new(LogRiskControl),
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Cannot initialize supervisor: {}", e);
            return ExitCode::from(1);
        }
    };

    let supervisor = DaemonSupervisor::new(ctx.clone(), registry.clone());
    for probe_config in &config.probes {
        let probe = match HttpProbe::new(probe_config) {
            Ok(probe) => Arc::new(probe),
            Err(e) => {
                error!("Cannot build probe {}: {}", probe_config.name, e);
                return ExitCode::from(1);
            }
        };
        if let Err(e) = supervisor
            .register(
                probe,
                Duration::from_secs(probe_config.interval_secs),
                probe_config.critical,
            )
            .await
        {
            error!("Cannot register probe {}: {}", probe_config.name, e);
            return ExitCode::from(1);
        }
    }

    install_signal_handlers(ctx.shutdown.clone());

    let orchestrator = Arc::new(RecoveryOrchestrator::new(
        ctx.clone(),
        supervisor.command_sender(),
    ));

    let control_state = ControlState {
        monitor: ctx.monitor.clone(),
        orchestrator: orchestrator.clone(),
        backup: ctx.backup.clone(),
        registry,
        started_at: chrono::Utc::now(),
    };
    let bind = config.control.bind.clone();
    let control_cancel = ctx.shutdown.trigger();
    tokio::spawn(async move {
        if let Err(e) = control::serve(control_state, &bind, control_cancel).await {
            error!("Control server failed: {}", e);
        }
    });

    match supervisor.run(orchestrator).await {
        Ok(termination) => {
            info!("Daemon exited: {:?}", termination);
            ExitCode::from(termination.exit_code())
        }
        Err(e) => {
            error!("Supervisor failed: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run_status(addr: &str) -> ExitCode {
    match control::fetch_status(addr).await {
        Ok(status) => {
            println!("recovery state: {}", status.recovery_state);
            println!("aggregate:      {}", status.aggregate);
            println!("uptime:         {}s", status.uptime_seconds);
            println!("components:");
            for component in &status.components {
                let marker = if component.critical { "*" } else { " " };
                let last = component
                    .last_heartbeat
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {}{:<24} {:<9} last heartbeat: {}",
                    marker, component.name, component.status.to_string(), last
                );
            }
            println!("checkpoints:    {}", status.checkpoints.len());
            if let Some(latest) = status.checkpoints.first() {
                println!(
                    "  latest: {} ({}, {} bytes, {})",
                    latest.id, latest.tag, latest.size, latest.tier
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Status request failed: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run_checkpoint(addr: &str) -> ExitCode {
    match control::request_checkpoint(addr).await {
        Ok(meta) => {
            println!("checkpoint {} created ({} bytes)", meta.id, meta.size);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Checkpoint request failed: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run_recover(addr: &str) -> ExitCode {
    match control::request_recover(addr).await {
        Ok(()) => {
            println!("recovery sequence requested");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Recover request failed: {}", e);
            ExitCode::from(1)
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vigil.log");
            if config.json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .json()
                    .with_writer(appender)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(appender)
                    .init();
            }
        }
        None => {
            if config.json {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
    }
}
