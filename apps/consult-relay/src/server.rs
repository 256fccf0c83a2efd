use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{signal, task::JoinHandle};
use tracing::info;

use crate::bookkeeping::{AllowAllRooms, HttpRoomAuthority, RoomAuthority};
use crate::config::ServerConfig;
use crate::identity::IdentityVerifier;
use crate::persistence::{EventSink, NullSink, RedisSink};
use crate::registry::RoomRegistry;
use crate::routes;
use crate::websocket::AppState;

/// Wires collaborators from configuration.
pub async fn build_state(
    config: &ServerConfig,
    metrics: Option<PrometheusHandle>,
) -> Result<Arc<AppState>> {
    let authority: Arc<dyn RoomAuthority> = match &config.booking_url {
        Some(url) => Arc::new(
            HttpRoomAuthority::new(url).context("failed to build bookkeeping client")?,
        ),
        None => Arc::new(AllowAllRooms),
    };
    let sink: Arc<dyn EventSink> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisSink::new(url, config.event_ttl.as_secs())
                .await
                .context("failed to connect to redis")?,
        ),
        None => Arc::new(NullSink),
    };

    Ok(Arc::new(AppState {
        registry: RoomRegistry::new(config.relay.clone()),
        verifier: IdentityVerifier::from_secret(config.jwt_secret.as_deref()),
        authority,
        sink,
        metrics,
    }))
}

/// Starts the liveness monitor for the state's registry.
pub fn spawn_monitor(state: &Arc<AppState>) -> JoinHandle<()> {
    let effects_state = Arc::clone(state);
    state.registry.spawn_monitor(move |room_id, effects| {
        effects_state.apply_effects(&room_id, effects);
    })
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = build_state(&config, Some(metrics)).await?;
    if state.verifier.is_trusted() {
        info!("no identity secret configured; trusting query identity");
    }
    let monitor_handle = spawn_monitor(&state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("consult-relay listening on {}", config.listen_addr);

    let graceful =
        axum::serve(listener, routes::router(state)).with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    monitor_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
