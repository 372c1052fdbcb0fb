//! Tripguard server.
//!
//! Wires storage, alert channels, the monitoring scheduler and the HTTP API
//! together, then runs until Ctrl+C. On shutdown the HTTP server drains and
//! every monitoring loop finishes its current cycle before the process exits.
//!
//! # Configuration
//!
//! See [`tripguard::config::MonitorConfig`]; everything comes from
//! `TRIPGUARD_*` environment variables.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tripguard::alerts::AlertService;
use tripguard::api::{self, AppState};
use tripguard::channels::build_channels;
use tripguard::clock::{Clock, SystemClock};
use tripguard::config::MonitorConfig;
use tripguard::dedup::DedupGuard;
use tripguard::fanout::NotificationFanout;
use tripguard::scheduler::{MonitoringScheduler, SchedulerSettings};
use tripguard::storage::Storage;
use tripguard::trips::TripService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Contact details are never logged; INFO keeps request bodies out too.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("tripguard=info".parse()?))
        .init();

    let config = MonitorConfig::from_env();
    info!(
        port = config.port,
        db_url = %config.database_url,
        channels = config.channels.len(),
        "Starting Tripguard server"
    );

    let storage = Arc::new(Storage::new(&config.database_url).await?);
    info!("Database initialized");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let channels = build_channels(&config, storage.clone());
    if channels.is_empty() {
        warn!("No alert channels configured, alerts will be recorded but not delivered");
    }
    let fanout = Arc::new(NotificationFanout::new(
        storage.clone(),
        channels,
        config.max_concurrent_sends,
        clock.clone(),
    ));

    let dedup = Arc::new(DedupGuard::new(config.dedup_cooldown()));
    let scheduler = Arc::new(MonitoringScheduler::new(
        storage.clone(),
        fanout.clone(),
        dedup,
        clock.clone(),
        SchedulerSettings::from(&config),
        config.high_risk_enabled,
    ));
    if let Err(e) = scheduler.warm_dedup().await {
        warn!(error = %e, "Could not warm dedup guard, recent alerts may repeat");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = scheduler.spawn(shutdown_rx.clone());

    let state = AppState {
        trips: Arc::new(TripService::new(storage.clone(), clock.clone())),
        alerts: Arc::new(AlertService::new(storage.clone(), fanout, clock)),
        scheduler,
    };
    let app = api::router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Tripguard is listening");

    let signal = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "Monitoring loop ended abnormally");
        }
    }
    signal.abort();

    info!("Tripguard shutdown complete");
    Ok(())
}
