use std::sync::Arc;

use procwarden::config::GlobalConfig;
use procwarden::{JsonApplicationStore, Supervisor, SupervisorEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("procwarden starting");

    let config_path = GlobalConfig::resolve_path();
    let cfg = GlobalConfig::load(&config_path)?;

    let store = Arc::new(JsonApplicationStore::open(&cfg.applications_path)?);
    tracing::info!("Using application list {}", store.path().display());

    let supervisor = build_supervisor(store, &cfg)?;

    // 상태 변경 이벤트 로깅 (UI 대신)
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SupervisorEvent::StatusChanged { name, running }) => {
                    tracing::info!("[{}] {}", name, if running { "running" } else { "stopped" });
                }
                Ok(SupervisorEvent::Restarted { name }) => {
                    tracing::info!("[{}] automatically restarted", name);
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger skipped {} events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    supervisor.start_monitoring();

    wait_for_shutdown().await;
    tracing::info!("Shutdown signal received, stopping monitoring");
    // 관리 대상 애플리케이션은 종료하지 않음. 감시만 멈춘다
    supervisor.shutdown().await;

    tracing::info!("procwarden shutting down");
    Ok(())
}

#[cfg(unix)]
fn build_supervisor(store: Arc<JsonApplicationStore>, cfg: &GlobalConfig) -> anyhow::Result<Supervisor> {
    Ok(Supervisor::with_system_backends(store, cfg))
}

#[cfg(not(unix))]
fn build_supervisor(_store: Arc<JsonApplicationStore>, _cfg: &GlobalConfig) -> anyhow::Result<Supervisor> {
    anyhow::bail!("procwarden only supports Unix hosts")
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    tokio::signal::ctrl_c().await.ok();
}
