//! Campaign panel integration

mod client;
mod types;

pub use client::{HttpPanel, Panel};
pub use types::{ActiveScenario, Batch, CallReport, Contact, PanelAgent, PanelLine};
