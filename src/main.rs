use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tracker_sync::cli::Args;
use tracker_sync::config::Config;
use tracker_sync::geolocation::ChannelGeolocation;
use tracker_sync::identity::MemoryIdentity;
use tracker_sync::markers::MarkerLayer;
use tracker_sync::model::{timestamp_value, Fields, GeoPoint, Incident, LocationRecord};
use tracker_sync::session::SessionController;
use tracker_sync::store::{MemoryStore, RemoteStore, WriteMode};
use tracker_sync::surface::HeadlessContainer;

const DEFAULT_ADMIN_ID: &str = "demo-admin";
const TICK: Duration = Duration::from_secs(2);
const STATUS_EVERY: Duration = Duration::from_secs(5);

type Controller = SessionController<MemoryStore, MemoryIdentity, ChannelGeolocation>;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tracker_sync=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn offset(origin: GeoPoint, step: u64, lane: usize) -> GeoPoint {
    let drift = (step % 20) as f64 * 0.0002;
    GeoPoint::new(
        origin.latitude + drift + lane as f64 * 0.001,
        origin.longitude - drift + lane as f64 * 0.0015,
    )
}

fn seed_simulated_users(store: &MemoryStore, config: &Config, count: usize) {
    let origin = config.fallback_position;
    for lane in 0..count {
        let id = format!("sim-{lane}");
        let name = format!("Field User {}", lane + 1);
        let fields = LocationRecord::owned_fields(&id, &name, offset(origin, 0, lane + 1), Utc::now());
        store.seed(&config.locations_collection, &id, fields);
    }
}

/// Moves the simulated users and the device, and files one incident.
async fn simulate(
    store: MemoryStore,
    geo: ChannelGeolocation,
    config: Config,
    users: usize,
    cancel: CancellationToken,
) {
    let origin = config.fallback_position;
    let mut step = 0u64;
    let mut ticker = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        step += 1;
        geo.push(Ok(offset(origin, step, 0)));

        for lane in 0..users {
            // Every other user goes quiet so the roster shows both states.
            if lane % 2 == 1 && step > 1 {
                continue;
            }
            let id = format!("sim-{lane}");
            let mut fields = Fields::new();
            let point = offset(origin, step, lane + 1);
            fields.insert("latitude".to_string(), json!(point.latitude));
            fields.insert("longitude".to_string(), json!(point.longitude));
            fields.insert("updatedAt".to_string(), timestamp_value(Utc::now()));
            if let Err(err) = store
                .upsert_document(&config.locations_collection, &id, fields, WriteMode::Merge)
                .await
            {
                tracing::warn!(user_id = %id, error = %err, "simulated location update failed");
            }
        }

        if step == 3 && users > 0 {
            let fields = Incident::new_report_fields(
                "sim-0",
                "Field User 1",
                "Twisted ankle near the ridge",
                offset(origin, step, 1),
                Utc::now(),
            );
            match store.add_document(&config.incidents_collection, fields).await {
                Ok(id) => tracing::info!(incident_id = %id, "simulated incident filed"),
                Err(err) => tracing::warn!(error = %err, "simulated incident failed"),
            }
        }
    }
}

async fn log_status(controller: Controller, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(STATUS_EVERY);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let registry = controller.registry();
        let published = controller.published();
        let online = published.roster().iter().filter(|row| row.online).count();
        let streams = controller.active_streams().await;
        tracing::info!(
            state = ?controller.session_state(),
            surface = ?controller.surface().phase(),
            presence_markers = registry.live_count(MarkerLayer::Presence),
            incident_markers = registry.live_count(MarkerLayer::Incident),
            pending = registry.pending_count(),
            roster = published.roster().len(),
            online,
            active_incidents = published.incidents().len(),
            streams = ?streams,
            "tracker status"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    init_tracing()?;

    if args.admin && config.super_admin_id.is_none() {
        config.super_admin_id = Some(DEFAULT_ADMIN_ID.to_string());
    }

    let store = MemoryStore::new();
    let identity = MemoryIdentity::new();
    let geo = ChannelGeolocation::new();
    // Starts detached so the first snapshots exercise the deferred-marker path.
    let container = Arc::new(HeadlessContainer::detached());
    seed_simulated_users(&store, &config, args.simulated_users);

    let controller = SessionController::new(
        config.clone(),
        store.clone(),
        identity.clone(),
        geo.clone(),
        container.clone(),
    );
    let shutdown = CancellationToken::new();

    let run_handle = {
        let controller = controller.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { controller.run(token).await })
    };

    let mut notices = controller.view().notices;
    let notice_token = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notice_token.cancelled() => return,
                notice = notices.recv() => match notice {
                    Ok(notice) => tracing::info!(level = ?notice.level, "{}", notice.message),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "notice log lagged");
                    }
                    Err(_) => return,
                },
            }
        }
    });

    if let Some(admin_id) = config.super_admin_id.clone().filter(|_| args.admin) {
        identity.register(&admin_id, &args.email, &args.password, args.name.as_deref())?;
        controller.sign_in(&args.email, &args.password).await?;
    } else {
        controller
            .sign_up(&args.email, &args.password, args.name.as_deref())
            .await?;
    }

    tokio::spawn({
        let container = container.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tracing::info!("map container attached");
            container.attach();
        }
    });
    tokio::spawn(simulate(
        store.clone(),
        geo.clone(),
        config.clone(),
        args.simulated_users,
        shutdown.clone(),
    ));
    tokio::spawn(log_status(controller.clone(), shutdown.clone()));

    let run_for = async {
        match args.run_seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = run_for => {
            tracing::info!("run time elapsed");
        }
    }

    controller.sign_out().await?;
    shutdown.cancel();
    if let Err(err) = run_handle.await {
        tracing::error!(error = %err, "session controller task failed");
    }
    tracing::info!(
        markers = controller.registry().total_live(),
        subscriptions = store.active_subscriptions(),
        "shutdown complete"
    );
    Ok(())
}
