//! # voice-relay
//!
//! Relays call audio between a 48 kHz transport and a 24.1 kHz realtime voice
//! service. The binary in `main.rs` serves the HTTP API and the `/ws/call`
//! WebSocket transport on top of this library.

pub mod audio;
pub mod call;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod state;
pub mod transport;
pub mod voice;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;
