//! FFI bindings for native apps
//!
//! Exposes the device client via uniffi to Swift/Kotlin. The native side
//! supplies the audio output through [`DeviceCallback`].

mod handlers;
mod session;
mod types;

pub use session::*;
pub use types::*;
