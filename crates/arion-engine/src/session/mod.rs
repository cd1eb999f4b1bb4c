//! Sessions: state, correlation, lifecycle

mod cleanup;
mod manager;
mod signals;
mod types;

pub use signals::{WaitKey, WaitOutcome, Waiters};
pub use types::{Leg, LegState, Session, SessionHandle, SessionId, Timing};
