//! Dialer pause switch
//!
//! Four independent pause causes gate origination: a manual operator
//! pause, the consecutive-failure cascade, an external-service quota
//! refusal, and the panel's `call_allowed=false`. The first three latch
//! until an explicit `resume`; the panel flag follows each batch.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Manual,
    Cascade,
    Quota,
    PanelDisallow,
}

#[derive(Default)]
pub struct PauseState {
    manual: AtomicBool,
    cascade: AtomicBool,
    quota: AtomicBool,
    panel_disallow: AtomicBool,
}

impl PauseState {
    pub fn pause(&self, reason: PauseReason) {
        let flag = match reason {
            PauseReason::Manual => &self.manual,
            PauseReason::Cascade => &self.cascade,
            PauseReason::Quota => &self.quota,
            PauseReason::PanelDisallow => &self.panel_disallow,
        };
        if !flag.swap(true, Ordering::SeqCst) {
            warn!(?reason, "dialer paused");
        }
    }

    /// Explicit resume. Clears the latched causes; the panel flag is
    /// driven by batches, not by resume.
    pub fn resume(&self) {
        self.manual.store(false, Ordering::SeqCst);
        self.cascade.store(false, Ordering::SeqCst);
        self.quota.store(false, Ordering::SeqCst);
        info!("dialer resumed");
    }

    /// Track the panel's `call_allowed` verdict from the latest batch.
    pub fn set_panel_allowed(&self, allowed: bool) {
        let was_disallowed = self.panel_disallow.swap(!allowed, Ordering::SeqCst);
        if was_disallowed != !allowed {
            info!(allowed, "panel call_allowed changed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.active_reason().is_some()
    }

    pub fn active_reason(&self) -> Option<PauseReason> {
        if self.manual.load(Ordering::SeqCst) {
            Some(PauseReason::Manual)
        } else if self.cascade.load(Ordering::SeqCst) {
            Some(PauseReason::Cascade)
        } else if self.quota.load(Ordering::SeqCst) {
            Some(PauseReason::Quota)
        } else if self.panel_disallow.load(Ordering::SeqCst) {
            Some(PauseReason::PanelDisallow)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latched_causes_survive_panel_allow() {
        let pause = PauseState::default();
        pause.pause(PauseReason::Quota);
        pause.set_panel_allowed(true);
        assert!(pause.is_paused());
        pause.resume();
        assert!(!pause.is_paused());
    }

    #[test]
    fn panel_flag_follows_batches() {
        let pause = PauseState::default();
        pause.set_panel_allowed(false);
        assert_eq!(pause.active_reason(), Some(PauseReason::PanelDisallow));
        pause.set_panel_allowed(true);
        assert!(!pause.is_paused());
    }

    #[test]
    fn resume_does_not_override_panel() {
        let pause = PauseState::default();
        pause.set_panel_allowed(false);
        pause.resume();
        assert!(pause.is_paused());
    }
}
