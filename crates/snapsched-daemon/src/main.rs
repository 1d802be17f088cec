use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use snapsched_core::SnapschedConfig;
use snapsched_scheduler::{
    LocalSnapDir, ScheduleStore, SchedulerEngine, SchedulerError, SchedulerEvent,
    SnapScheduleHandle,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

mod cli;
mod output;

use cli::{Cli, Command, RetentionCommand};
use output::{print_listing, print_message, print_statuses};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snapsched_daemon=info,snapsched_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<SchedulerError>() {
            Some(se) => {
                eprintln!("error [{}]: {se}", se.code());
                std::process::exit(if se.is_user_error() { 2 } else { 1 });
            }
            None => {
                eprintln!("error: {e:#}");
                std::process::exit(1);
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // explicit --config > SNAPSCHED_CONFIG env > ~/.snapsched/snapsched.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("SNAPSCHED_CONFIG").ok());
    let config = SnapschedConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({}), using defaults", e);
        SnapschedConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening schedule database");
    let store = Arc::new(ScheduleStore::open(
        db_path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?);
    let accessor = Arc::new(LocalSnapDir::from_config(&config)?);
    let handle = SnapScheduleHandle::new(
        store.clone(),
        accessor.clone(),
        config.scheduler.allow_minute_granularity,
    );
    let format = cli.format;

    match cli.command {
        Command::Serve => {
            let engine = SchedulerEngine::new(store, accessor, &config.scheduler);
            serve(engine).await;
        }
        Command::Add {
            target,
            cadence,
            start,
        } => {
            let start = start.as_deref().map(cli::parse_start).transpose()?;
            let record = handle.add_schedule(&target.to_target(), &cadence, start).await?;
            print_message(
                &format!("scheduled {} every {}", record.target, record.cadence),
                format,
            )?;
        }
        Command::Remove { target, cadence } => {
            let removed = handle
                .remove_schedule(&target.to_target(), cadence.as_deref())
                .await?;
            print_message(&format!("removed {removed} schedule(s)"), format)?;
        }
        Command::List { target } => {
            let listing = handle.list_schedules(&target.to_target()).await?;
            print_listing(&listing, format)?;
        }
        Command::Status {
            path,
            fs,
            subvol,
            group,
        } => {
            let statuses = match path {
                Some(path) => {
                    handle
                        .status(&cli::build_target(&path, &fs, &subvol, &group))
                        .await?
                }
                None => handle.status_all(fs.as_deref())?,
            };
            print_statuses(&statuses, format)?;
        }
        Command::Activate { target, cadence } => {
            let n = handle.activate(&target.to_target(), cadence.as_deref()).await?;
            print_message(&format!("activated {n} schedule(s)"), format)?;
        }
        Command::Deactivate { target, cadence } => {
            let n = handle
                .deactivate(&target.to_target(), cadence.as_deref())
                .await?;
            print_message(&format!("deactivated {n} schedule(s)"), format)?;
        }
        Command::Purge { target } => {
            let n = handle.remove_subtree(&target.to_target()).await?;
            print_message(&format!("purged {n} path(s)"), format)?;
        }
        Command::Retention { action } => match action {
            RetentionCommand::Add { target, spec } => {
                let spec = spec.parse()?;
                handle.add_retention(&target.to_target(), spec).await?;
                print_message(&format!("retention {spec} added"), format)?;
            }
            RetentionCommand::Remove { target, spec } => {
                let spec = spec.parse()?;
                handle.remove_retention(&target.to_target(), spec).await?;
                print_message(&format!("retention {spec} removed"), format)?;
            }
        },
    }
    Ok(())
}

/// Run the engine until SIGINT/SIGTERM, logging every scheduler event.
async fn serve(engine: SchedulerEngine) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });
    info!("snapsched daemon running");

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        error!("scheduler task ended abnormally: {e}");
    }
}

fn log_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::Created { target, cadence, name } => {
            info!(path = %target, cadence = %cadence, snapshot = %name, "snapshot created")
        }
        SchedulerEvent::Pruned { target, name } => {
            info!(path = %target, snapshot = %name, "snapshot pruned")
        }
        SchedulerEvent::Failed {
            target,
            cadence,
            error,
            consecutive_failures,
        } => warn!(
            path = %target,
            cadence = %cadence,
            failures = consecutive_failures,
            "snapshot failed: {error}"
        ),
        SchedulerEvent::Deactivated { target, cadence } => {
            warn!(path = %target, cadence = %cadence, "schedule deactivated")
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
