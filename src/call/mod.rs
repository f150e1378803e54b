//! # Call Sessions
//!
//! - **session**: Per-call state machine owning the audio pipeline
//! - **registry**: Id → session map shared by the HTTP and WebSocket handlers

pub mod registry;
pub mod session;

pub use registry::SessionRegistry;
pub use session::{CallSession, CallSessionInfo, CallState};
