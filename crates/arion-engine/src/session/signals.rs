//! Per-session event waiters
//!
//! Flow steps that depend on an asynchronous telephony outcome (playback
//! finished, recording finished, operator leg answered) park on a one-shot
//! signal keyed by the id they are waiting for. The event side completes
//! the signal; if the completion arrives before anyone registered — the
//! REST response naming the id can lose the race against the event stream —
//! the outcome is buffered and handed out at registration.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// What a flow step can wait for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    Playback(String),
    Recording(String),
    /// Channel id of an operator leg awaiting answer.
    Answer(String),
}

/// How the wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    PlaybackDone,
    RecordingDone,
    RecordingFailed(String),
    Answered,
    /// The awaited channel hung up or failed instead.
    Hungup,
}

#[derive(Default)]
struct WaiterState {
    pending: HashMap<WaitKey, oneshot::Sender<WaitOutcome>>,
    ready: HashMap<WaitKey, WaitOutcome>,
}

/// One session's waiter table.
#[derive(Default)]
pub struct Waiters {
    state: Mutex<WaiterState>,
}

impl Waiters {
    /// Register interest in a key. If the outcome already arrived the
    /// receiver resolves immediately. A second registration for the same
    /// key replaces the first (whose receiver then errors out).
    pub fn register(&self, key: WaitKey) -> oneshot::Receiver<WaitOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if let Some(outcome) = state.ready.remove(&key) {
            let _ = tx.send(outcome);
        } else {
            state.pending.insert(key, tx);
        }
        rx
    }

    /// Deliver an outcome. Buffered when nobody is waiting yet.
    pub fn complete(&self, key: WaitKey, outcome: WaitOutcome) {
        let mut state = self.state.lock();
        match state.pending.remove(&key) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                state.ready.insert(key, outcome);
            }
        }
    }

    /// Drop a registration the caller no longer cares about.
    pub fn forget(&self, key: &WaitKey) {
        let mut state = self.state.lock();
        state.pending.remove(key);
        state.ready.remove(key);
    }

    /// Fail every pending waiter; used when the customer leg dies.
    pub fn abort_all(&self) {
        let mut state = self.state.lock();
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(WaitOutcome::Hungup);
        }
        state.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_complete() {
        let waiters = Waiters::default();
        let rx = waiters.register(WaitKey::Playback("p1".into()));
        waiters.complete(WaitKey::Playback("p1".into()), WaitOutcome::PlaybackDone);
        assert_eq!(rx.await.unwrap(), WaitOutcome::PlaybackDone);
    }

    #[tokio::test]
    async fn complete_before_register_is_buffered() {
        let waiters = Waiters::default();
        waiters.complete(WaitKey::Recording("r1".into()), WaitOutcome::RecordingDone);
        let rx = waiters.register(WaitKey::Recording("r1".into()));
        assert_eq!(rx.await.unwrap(), WaitOutcome::RecordingDone);
    }

    #[tokio::test]
    async fn abort_fails_pending_waiters() {
        let waiters = Waiters::default();
        let rx = waiters.register(WaitKey::Answer("c9".into()));
        waiters.abort_all();
        assert_eq!(rx.await.unwrap(), WaitOutcome::Hungup);
    }

    #[tokio::test]
    async fn forget_discards_buffered_outcomes() {
        let waiters = Waiters::default();
        waiters.complete(WaitKey::Playback("p1".into()), WaitOutcome::PlaybackDone);
        waiters.forget(&WaitKey::Playback("p1".into()));
        let rx = waiters.register(WaitKey::Playback("p1".into()));
        // Nothing buffered anymore; completing again resolves it.
        waiters.complete(WaitKey::Playback("p1".into()), WaitOutcome::PlaybackDone);
        assert_eq!(rx.await.unwrap(), WaitOutcome::PlaybackDone);
    }
}
