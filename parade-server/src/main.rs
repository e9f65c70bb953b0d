//! Parade Sync - Coordination Server
//!
//! Serves the track catalog and authoritative playback state to players
//! and controllers over WebSocket, with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode
//!
//! Environment: PORT, BIND_ADDR, TRACKS_PATH, PLAYLIST,
//! BACK_THRESHOLD_MS, AUTO_ADVANCE_EPSILON_MS

mod dashboard;
mod metrics;
mod network;

use std::sync::Arc;
use parking_lot::RwLock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        dashboard::run(metrics).await
    } else {
        network::run_with_logging(metrics).await
    }
}
