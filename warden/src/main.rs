use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden::api::{self, ApiState};
use warden::config::Config;
use warden::db;
use warden::gate::SafetyGate;
use warden::health::HealthRepo;
use warden::hub::SessionHub;
use warden::scheduler::Scheduler;
use warden::sessions::SessionRepo;
use warden::supervisor::{SessionSupervisor, SupervisorConfig, WorkerSpec};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, "warden starting");

    let pool = db::connect(&config.database_url).await?;

    let hub = Arc::new(SessionHub::new(config.hub_history));
    let sessions = SessionRepo::new(pool.clone());
    let health = HealthRepo::new(pool.clone());
    let gate = SafetyGate::new(pool.clone());

    let spec = WorkerSpec {
        binary: config.worker_binary.clone(),
        model: config.worker_model.clone(),
        escalation_model: config.escalation_model.clone(),
        prompt_path: config.prompt_path.clone(),
        allowed_tools: config.allowed_tools.clone(),
        state_dir: config.state_dir.clone(),
        results_dir: config.results_dir.clone(),
        dry_run: config.dry_run,
    };
    let supervisor = Arc::new(SessionSupervisor::new(
        sessions.clone(),
        Arc::clone(&hub),
        spec,
        SupervisorConfig {
            logs_dir: config.logs_dir.clone().into(),
            session_timeout: config.session_timeout,
            term_grace: config.term_grace,
        },
    ));

    let cancel = CancellationToken::new();
    let (trigger_tx, trigger_rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(
        supervisor,
        config.schedule_interval,
        trigger_rx,
        cancel.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    // Shutdown order: stop admitting, terminate and drain in-flight
    // sessions (the scheduler does both), then close the hub so stream
    // subscribers see end-of-stream.
    let drain = tokio::spawn({
        let hub = Arc::clone(&hub);
        async move {
            if let Err(e) = scheduler_task.await {
                error!(error = %e, "scheduler task failed");
            }
            hub.close_all();
        }
    });

    let state = ApiState {
        sessions,
        health,
        gate,
        hub: Arc::clone(&hub),
        trigger_tx,
    };
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                shutdown_signal().await;
                info!("shutdown signal received");
                cancel.cancel();
            }
        })
        .await?;

    if let Err(e) = drain.await {
        error!(error = %e, "drain task failed");
    }
    info!("warden stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let term = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = term => {}
    }
}
