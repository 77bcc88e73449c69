mod alert;
mod config;
mod dispatch;
mod hub;
mod ingress;
mod mapping;
mod state;
mod web;

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use alert::{AlertNotifier, SystemClock};
use config::Settings;
use dispatch::{DispatchPolicy, Dispatcher};
use hub::HubClient;
use mapping::MappingStore;
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── Env config ──────────────────────────────────────────────────
    let settings = Settings::from_env();
    settings.validate()?;

    // ── Device mapping ──────────────────────────────────────────────
    let mapping = Arc::new(MappingStore::open(&settings.mapping_path));
    let mapped_devices = mapping.snapshot().len();

    // ── Hub client ──────────────────────────────────────────────────
    let hub = HubClient::new(&settings.hub)?;
    info!(
        hub = hub.base_url(),
        simulator = settings.hub.simulator,
        optimistic_ack = settings.optimistic_ack,
        "hub client ready"
    );

    // ── Alerts ──────────────────────────────────────────────────────
    let notifier = Arc::new(AlertNotifier::new(
        alert::transport_from_settings(&settings.smtp),
        Arc::new(SystemClock),
        Duration::from_secs(settings.alert_cooldown_secs),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        mapping,
        hub.clone(),
        notifier,
        DispatchPolicy {
            optimistic_ack: settings.optimistic_ack,
            icon_on: settings.hub.icon_for(true),
            icon_off: settings.hub.icon_for(false),
        },
    ));

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = SystemState::new(
        hub.base_url().to_string(),
        settings.hub.simulator,
        mapped_devices,
    )
    .shared();
    shared
        .write()
        .await
        .record_system("bridge started".to_string());

    // ── Web server ──────────────────────────────────────────────────
    let ip: IpAddr = settings
        .web
        .host
        .parse()
        .with_context(|| format!("invalid WEB_HOST '{}'", settings.web.host))?;
    let addr = SocketAddr::new(ip, settings.web.port);

    web::serve(AppState { dispatcher, shared }, addr).await
}
