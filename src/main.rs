#[macro_use]
extern crate rocket;

mod api;
mod cache;
mod client;
mod clock;
mod config;
mod controller;
mod env;
mod error;
mod models;
mod report;
mod session;
mod sheets;
mod store;
mod telemetry;
#[cfg(test)]
mod test;
mod validation;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use api::{
    api_add_subject, api_get_attendance, api_get_roster, api_monthly_report, api_operator_action,
    api_upsert_attendance, health,
};
use cache::TabularCache;
use client::RateLimitedClient;
use clock::{Clock, SystemClock};
use config::{AppConfig, SheetBackend};
use controller::MarkingController;
use env::load_environment;
use error::AppError;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket, tokio};
use session::SessionManager;
use sheets::{MemorySheetStore, SqliteSheetStore, TabularStore};
use sqlx::SqlitePool;
use store::AttendanceStore;
use telemetry::{TELEMETRY_GUARD, TelemetryFairing, init_tracing, shutdown_telemetry};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Rocket(Box<rocket::Error>),
    #[error("Application error: {0}")]
    App(#[from] AppError),
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::Anyhow(value)
    }
}

impl From<rocket::Error> for Error {
    fn from(value: rocket::Error) -> Self {
        Error::Rocket(Box::new(value))
    }
}

/// Everything the routes share, wired over one sheet backend.
pub struct Components {
    pub config: Arc<AppConfig>,
    pub cache: Arc<TabularCache>,
    pub store: Arc<AttendanceStore>,
    pub controller: MarkingController,
}

impl Components {
    pub fn new(config: AppConfig, sheets: Arc<dyn TabularStore>, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(config);
        let client = Arc::new(RateLimitedClient::new(sheets, config.rate_limit.clone()));
        let cache = Arc::new(TabularCache::new(
            client.clone(),
            clock.clone(),
            config.cache_ttl,
        ));
        let store = Arc::new(AttendanceStore::new(client, cache.clone(), &config.group_id));
        let sessions = Arc::new(SessionManager::new(clock, config.session_idle_ttl));
        let controller =
            MarkingController::new(config.clone(), sessions, cache.clone(), store.clone());

        Self {
            config,
            cache,
            store,
            controller,
        }
    }
}

async fn open_sheet_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TabularStore>> {
    match config.backend {
        SheetBackend::Memory => {
            info!("Using in-memory sheets");
            Ok(Arc::new(MemorySheetStore::new()))
        }
        SheetBackend::Sqlite => {
            let pool = SqlitePool::connect(&config.database_url)
                .await
                .with_context(|| format!("Failed to connect to {}", config.database_url))?;
            let store = SqliteSheetStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("Failed to create sheet schema")?;
            info!("Using SQLite sheets");
            Ok(Arc::new(store))
        }
    }
}

fn spawn_session_sweeper(sessions: Arc<SessionManager>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            sessions.evict_idle().await;
        }
    });
}

#[rocket::main]
async fn main() -> Result<(), Error> {
    load_environment()?;

    if let Some(guard) = init_tracing() {
        match TELEMETRY_GUARD.lock() {
            Ok(mut slot) => *slot = Some(guard),
            Err(_) => error!("Telemetry guard lock poisoned, spans may not be flushed"),
        }
    }

    let config = AppConfig::from_env()?;
    let sheets = open_sheet_store(&config).await?;
    let components = Components::new(config, sheets, Arc::new(SystemClock));

    spawn_session_sweeper(
        components.controller.sessions().clone(),
        components.config.session_sweep_interval,
    );

    let _rocket = init_rocket(components).launch().await?;
    Ok(())
}

pub fn init_rocket(components: Components) -> Rocket<Build> {
    info!(group_id = %components.config.group_id, "Starting attendance tracker");

    rocket::build()
        .manage(components.config)
        .manage(components.cache)
        .manage(components.store)
        .manage(components.controller)
        .mount(
            "/api",
            routes![
                api_operator_action,
                api_get_roster,
                api_add_subject,
                api_get_attendance,
                api_upsert_attendance,
                api_monthly_report,
            ],
        )
        .mount("/api", routes![health])
        .attach(TelemetryFairing)
        .attach(AdHoc::on_shutdown("Telemetry shutdown", |_| {
            Box::pin(async { shutdown_telemetry() })
        }))
}
