//! Sync Engine
//!
//! Wire protocol and the authoritative playback state machine.

mod protocol;
mod state;

pub use protocol::*;
pub use state::*;
