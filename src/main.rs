//! Sightgrid Backend - Multi-Camera Person Re-Identification
//!
//! Assigns a stable, facility-wide identity to every person visible on any
//! camera, keeping counts and named profiles consistent as people move
//! between overlapping and non-overlapping fields of view.
//!
//! # Architecture
//!
//! This application follows Clean Architecture principles:
//! - **Domain**: Core business entities and rules
//! - **Application**: The identity engine, use cases, and periodic jobs
//! - **Infrastructure**: External interfaces (DB, Camera, Web)

mod application;
mod domain;
mod infrastructure;

use anyhow::Result;
use infrastructure::{config::AppConfig, server::Server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting Sightgrid Backend v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    let server = Server::new(config).await?;

    server.run().await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sightgrid_backend=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
