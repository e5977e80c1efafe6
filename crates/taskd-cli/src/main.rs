mod auth;
mod config;
mod http;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use taskd_core::app::TaskService;
use taskd_core::impls::{HookNotifier, SqliteTaskStore};
use taskd_core::ports::{
    Clock, NoopNotifier, Notifier, StoreError, SystemClock, TaskStore, UlidGenerator,
};
use taskd_core::queue::QueueRunner;
use taskd_core::supervisor::ProcessSupervisor;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::AuthToken;
use crate::config::Cli;

/// Upper bound on the whole shutdown sequence.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let token = cli.auth_token()?;
    config::report_agent_auth();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::open(&cli.db_path)
            .with_context(|| format!("opening database {}", cli.db_path.display()))?
            .with_clock(clock.clone()),
    );

    let supervisor_config = cli.supervisor_config();
    info!(
        agent = %supervisor_config.agent_path.display(),
        max_turns = supervisor_config.max_turns,
        timeout_ms = supervisor_config.timeout.as_millis() as u64,
        "agent configured"
    );
    let supervisor = Arc::new(ProcessSupervisor::new(supervisor_config));

    let notifier: Arc<dyn Notifier> = match cli.notify_hook.as_deref().map(str::trim) {
        Some(cmd) if !cmd.is_empty() => {
            info!(hook = cmd, "notifications enabled");
            Arc::new(HookNotifier::new(cmd))
        }
        _ => {
            info!("notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    let runner = Arc::new(QueueRunner::new(
        store.clone(),
        supervisor,
        notifier,
        clock.clone(),
        cli.runner_config(),
    ));
    runner.recover().await.context("recovering interrupted tasks")?;

    let service = Arc::new(TaskService::new(
        store,
        runner.clone(),
        Arc::new(UlidGenerator::new(SystemClock)),
        clock,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut runner_handle = {
        let runner = runner.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { runner.run(rx).await })
    };

    let addr = cli.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, db = %cli.db_path.display(), "taskd listening");

    let mut server_rx = shutdown_rx;
    let server = axum::serve(listener, http::router(service, AuthToken::new(token)))
        .with_graceful_shutdown(async move {
            let _ = server_rx.wait_for(|stop| *stop).await;
        });
    let mut server_handle = tokio::spawn(async move { server.await });

    // a store failure stops the runner, which takes the daemon down with it
    let (mut server_done, mut runner_done, mut runner_ok) = (false, false, true);
    tokio::select! {
        _ = wait_for_signal() => {}
        res = &mut server_handle => {
            server_done = true;
            match res {
                Ok(Ok(())) => warn!("http server stopped unexpectedly"),
                Ok(Err(err)) => error!(error = %err, "http server failed"),
                Err(err) => error!(error = %err, "http server task panicked"),
            }
        }
        res = &mut runner_handle => {
            runner_done = true;
            runner_ok = log_runner_exit(res);
        }
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let ok = runner_done || log_runner_exit(runner_handle.await);
        if !server_done && let Ok(Err(err)) = server_handle.await {
            error!(error = %err, "http server failed during shutdown");
        }
        ok
    };
    match tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await {
        Ok(ok) => runner_ok &= ok,
        Err(_) => {
            error!("shutdown did not finish within {:?}, forcing exit", SHUTDOWN_DEADLINE);
            std::process::exit(1);
        }
    }

    if !runner_ok {
        bail!("queue runner stopped on an unrecoverable error");
    }
    info!("taskd stopped");
    Ok(())
}

/// Logs how the runner ended; true for a clean stop.
fn log_runner_exit(res: Result<Result<(), StoreError>, JoinError>) -> bool {
    match res {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!(error = %err, "queue runner failed");
            false
        }
        Err(err) => {
            error!(error = %err, "queue runner task panicked");
            false
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("received Ctrl+C"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(err) => warn!("failed to install SIGTERM handler: {}", err),
        }
    }
    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C"),
        Err(err) => {
            warn!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    }
}
