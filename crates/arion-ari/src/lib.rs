//! Typed client for the telephony server's REST + event control interface
//!
//! This crate is the protocol layer of the Arion engine. It exposes:
//!
//! - [`AriClient`] — typed HTTP operations (channels, bridges, playbacks,
//!   recordings, origination, channel variables) with categorized errors
//!   and a bounded connection pool.
//! - [`EventStream`] — the long-lived WebSocket subscription delivering
//!   [`AriEvent`]s, with exponential-backoff reconnection.
//!
//! Policy (retries, timeouts beyond the per-call deadline, session
//! correlation) lives above this crate in `arion-engine`.

mod client;
mod error;
mod events;
mod stream;

pub use client::{AriClient, AriConfig, PlayTarget};
pub use error::{AriError, Result};
pub use events::{AriEvent, CallerId, Channel, Dialplan, LiveRecording, Playback};
pub use stream::{EventStream, StreamConfig};
