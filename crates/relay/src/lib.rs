//! Real-time collaboration relay for entity-relationship diagrams.
//!
//! One process owns the live CRDT session of every open diagram, the presence
//! roster and cursor positions of every active workspace, and the admission
//! checks that guard them. Clients talk to it over a single WebSocket per
//! diagram at `/v1/diagrams/{diagram_id}/ws`.

pub mod admission;
pub mod auth;
pub mod config;
pub mod cors;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod presence;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod ws;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
