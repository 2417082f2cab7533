//! healthshare daemon
//!
//! Serves the patient/researcher HTTP API over a local SQLite database and
//! blob store.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (dev JWT secret, filesystem blobs)
//! healthshare
//!
//! # Start with custom config
//! healthshare --config /path/to/config.toml
//!
//! # Production: secret required, 5xx detail hidden
//! HEALTHSHARE_JWT_SECRET=... healthshare --production --storage-dir /data/healthshare
//! ```

use clap::Parser;
use healthshare::collaborators::{BlobStore, FsBlobStore, JwtIdentity, MemoryBlobStore, MemoryLedger};
use healthshare::config::BlobBackend;
use healthshare::services::events::spawn_logging_listener;
use healthshare::services::{Collaborators, Services};
use healthshare::{Config, HealthDb, HttpServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "healthshare")]
#[command(about = "Consent-gated health data exchange")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "HEALTHSHARE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory (database, blobs, config.toml)
    #[arg(long, env = "HEALTHSHARE_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "HEALTHSHARE_HTTP_PORT")]
    http_port: Option<u16>,

    /// Production mode
    #[arg(long, env = "HEALTHSHARE_PRODUCTION")]
    production: bool,

    /// HS256 secret for bearer tokens (at least 32 characters)
    #[arg(long, env = "HEALTHSHARE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Keep blobs in memory instead of on disk
    #[arg(long)]
    memory_blobs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("healthshare=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if args.production {
        config.production = true;
    }
    if let Some(secret) = args.jwt_secret {
        config.jwt_secret = secret;
    }
    if args.memory_blobs {
        config.blob_backend = BlobBackend::Memory;
    }
    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        production = config.production,
        "Starting healthshare"
    );

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let config_path = config.config_path();
    if !config_path.exists() {
        // Never persist a secret that came from the environment
        let persisted = Config { jwt_secret: String::new(), ..config.clone() };
        persisted.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(HealthDb::open(&config.storage_dir)?);

    let blobs: Arc<dyn BlobStore> = match config.blob_backend {
        BlobBackend::Fs => Arc::new(FsBlobStore::new(config.blobs_dir()).await?),
        BlobBackend::Memory => {
            warn!("Blob store is in memory; payloads are lost on restart");
            Arc::new(MemoryBlobStore::new())
        }
    };

    let identity = if config.jwt_secret.is_empty() {
        warn!("No jwt_secret configured; using the development secret");
        Arc::new(JwtIdentity::new_dev())
    } else {
        Arc::new(JwtIdentity::new(config.jwt_secret.clone(), config.token_ttl_secs)?)
    };

    let collaborators = Collaborators {
        blobs,
        ledger: Arc::new(MemoryLedger::new()),
        verifier: identity.clone(),
        issuer: identity,
    };
    let services = Arc::new(Services::new(db, collaborators, config.rewards()));
    let _event_logger = spawn_logging_listener(services.events.clone());

    let http_addr: SocketAddr = format!("{}:{}", config.bind_host, config.http_port).parse()?;
    let http_server = Arc::new(
        HttpServer::new(services, http_addr).with_production(config.production),
    );

    info!("HTTP API available at http://{}", http_addr);
    info!("  GET  /health                        - Health check");
    info!("  POST /{{role}}/register|authenticate  - Identity");
    info!("  POST /patient/health-data           - Submit encrypted record");
    info!("  PUT  /patient/consent/{{recordId}}    - Update consent");
    info!("  GET  /researcher/datasets/search    - Discover datasets");

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server stopped");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
