//! Parade Sync - Core Library
//!
//! Synchronized playback across independent, clock-drifted devices. A
//! coordinator owns the authoritative playback state and turns controller
//! commands into a shared start-of-track timestamp; each device estimates
//! its offset to the coordinator's clock and works out where in the track
//! it should be right now.

pub mod catalog;
pub mod clock;
pub mod device;
pub mod ffi;
pub mod rejoin;
pub mod service;
pub mod sync;

// Re-exports for convenience
pub use catalog::{StaticCatalog, TrackCatalog, TrackInfo};
pub use clock::{Clock, MonotonicClock, OffsetEstimator, SyncError};
pub use device::{DeviceClient, DeviceConfig, DeviceHandle, LocalPlayer, PlaybackStart};
pub use service::{Coordinator, CoordinatorHandle, ServiceConfig, ServiceEvent};
pub use sync::{ClientMessage, PlaybackMachine, PlaybackSnapshot, ServerMessage};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
