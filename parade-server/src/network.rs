//! Network handling for the coordination server

use crate::metrics::{LogLevel, Metrics, ServerStatus};
use parade_core::clock::MonotonicClock;
use parade_core::service::{self, Coordinator, ServiceConfig, ServiceEvent};
use parade_core::StaticCatalog;
use parking_lot::RwLock;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Default catalog file name
const TRACKS_FILE: &str = "tracks.json";

/// Default WebSocket port
const DEFAULT_PORT: u16 = 3000;

/// Server settings, read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub tracks_path: PathBuf,
    pub service: ServiceConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ServiceConfig::default();

        let port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let tracks_path = lookup("TRACKS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(TRACKS_FILE));

        let back_threshold_ms = lookup("BACK_THRESHOLD_MS")
            .and_then(|v| v.parse().ok())
            .filter(|v: &i64| *v >= 0)
            .unwrap_or(defaults.back_threshold_ms);
        let auto_advance_epsilon_ms = lookup("AUTO_ADVANCE_EPSILON_MS")
            .and_then(|v| v.parse().ok())
            .filter(|v: &i64| *v >= 0)
            .unwrap_or(defaults.auto_advance_epsilon_ms);
        let initial_playlist = lookup("PLAYLIST")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind_addr,
            port,
            tracks_path,
            service: ServiceConfig {
                back_threshold_ms,
                auto_advance_epsilon_ms,
                initial_playlist,
            },
        }
    }
}

/// Run the coordinator and WebSocket listener, feeding `metrics` until
/// ctrl-c or a listener failure
pub async fn run_server(metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn Error>> {
    let config = ServerConfig::from_env();
    info!("Parade coordination server starting...");

    let catalog = match StaticCatalog::load(&config.tracks_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Failed to load {}: {}", config.tracks_path.display(), e);
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Catalog: {}", e));
            return Err(e.into());
        }
    };
    info!("Loaded {} tracks from {}", catalog.len(), config.tracks_path.display());

    {
        let mut m = metrics.write();
        m.catalog_size = catalog.len();
        m.log(
            LogLevel::Info,
            format!("Catalog: {} tracks from {}", catalog.len(), config.tracks_path.display()),
        );
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServiceEvent>();
    let coordinator = Coordinator::new(
        config.service.clone(),
        Arc::new(catalog),
        Arc::new(MonotonicClock::new()),
    )
    .with_events(event_tx)
    .start();

    let listener = match TcpListener::bind((config.bind_addr.as_str(), config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}:{}: {}", config.bind_addr, config.port, e);
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Bind {}:{} failed: {}", config.bind_addr, config.port, e));
            coordinator.shutdown();
            return Err(e.into());
        }
    };
    let local_addr = listener.local_addr()?;

    {
        let mut m = metrics.write();
        m.bind_addr = Some(local_addr.to_string());
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on ws://{}", local_addr));
    }

    let mut server = tokio::spawn(service::serve(listener, coordinator.clone()));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                log_event(&event);
                metrics.write().record(&event);
            }

            _ = &mut shutdown => {
                info!("Shutting down");
                metrics.write().log(LogLevel::Info, "Shutting down");
                coordinator.shutdown();
                server.abort();
                return Ok(());
            }

            result = &mut server => {
                let message = match result {
                    Ok(Ok(())) => "Listener stopped".to_string(),
                    Ok(Err(e)) => format!("Listener failed: {}", e),
                    Err(e) => format!("Listener task failed: {}", e),
                };
                error!("{}", message);
                let mut m = metrics.write();
                m.status = ServerStatus::Error;
                m.log(LogLevel::Error, message.clone());
                coordinator.shutdown();
                return Err(message.into());
            }
        }
    }
}

/// Mirror coordinator activity into the tracing log
fn log_event(event: &ServiceEvent) {
    match event {
        ServiceEvent::Joined { conn, role, session_id } => {
            info!("{} joined as {:?} (session {:?})", conn, role, session_id);
        }
        ServiceEvent::Left { conn, role, .. } => {
            info!("{} left ({:?})", conn, role);
        }
        ServiceEvent::StateChanged { snapshot } => {
            info!("Playback: {:?} {:?}", snapshot.mode, snapshot.track_id);
        }
        ServiceEvent::CommandRejected { command, reason } => {
            warn!("{} rejected: {}", command, reason);
        }
        ServiceEvent::AutoAdvanced { from, to } => {
            info!("Auto-advance from {} to {:?}", from, to);
        }
        ServiceEvent::Kicked { session_id } => {
            info!("Session {} kicked", session_id);
        }
        ServiceEvent::SessionsChanged { .. } | ServiceEvent::CommandApplied { .. } => {}
    }
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn Error>> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parade_server=info".parse()?)
                .add_directive("parade_core=info".parse()?),
        )
        .init();

    run_server(metrics).await
}
