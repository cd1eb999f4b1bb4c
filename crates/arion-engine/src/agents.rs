//! Operator rosters
//!
//! Two rosters (inbound, outbound) of live operators, replaced wholesale
//! from each panel batch and consulted round-robin by the transfer step.
//! Busy flags survive a roster refresh so an operator on a call is not
//! handed a second one just because a batch arrived mid-call.

use parking_lot::Mutex;
use tracing::debug;

/// A live operator as advertised by the panel.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    /// Panel-side id, when the agent came from a batch.
    pub id: Option<i64>,
    pub phone_number: String,
    pub busy: bool,
}

/// Which roster an agent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Inbound,
    Outbound,
}

#[derive(Default)]
struct RosterState {
    agents: Vec<Agent>,
    cursor: usize,
    /// True until the first panel batch replaces the static seed.
    seeded_only: bool,
}

/// One roster of agents with a round-robin cursor.
#[derive(Default)]
pub struct Roster {
    state: Mutex<RosterState>,
}

impl Roster {
    /// Seed from the static operator list. Used only until the first
    /// panel batch arrives; panel rosters take precedence afterwards.
    pub fn seed_static(&self, numbers: &[String]) {
        let mut state = self.state.lock();
        if !state.agents.is_empty() {
            return;
        }
        state.agents = numbers
            .iter()
            .map(|n| Agent {
                id: None,
                phone_number: n.clone(),
                busy: false,
            })
            .collect();
        state.seeded_only = true;
    }

    /// Replace the roster from a panel batch, preserving busy flags of
    /// agents still present.
    pub fn replace(&self, incoming: Vec<(Option<i64>, String)>) {
        let mut state = self.state.lock();
        let previous = std::mem::take(&mut state.agents);
        state.agents = incoming
            .into_iter()
            .map(|(id, phone_number)| {
                let busy = previous
                    .iter()
                    .any(|a| a.phone_number == phone_number && a.busy);
                Agent {
                    id,
                    phone_number,
                    busy,
                }
            })
            .collect();
        state.seeded_only = false;
        if state.cursor >= state.agents.len() {
            state.cursor = 0;
        }
    }

    /// Pick the next available agent round-robin and mark it busy.
    pub fn acquire(&self) -> Option<Agent> {
        let mut state = self.state.lock();
        let len = state.agents.len();
        if len == 0 {
            return None;
        }
        for offset in 0..len {
            let index = (state.cursor + offset) % len;
            if !state.agents[index].busy {
                state.agents[index].busy = true;
                state.cursor = (index + 1) % len;
                let agent = state.agents[index].clone();
                debug!(agent = %agent.phone_number, "agent acquired");
                return Some(agent);
            }
        }
        None
    }

    /// Clear the busy flag. Safe to call for an agent that has since left
    /// the roster.
    pub fn release(&self, phone_number: &str) {
        let mut state = self.state.lock();
        if let Some(agent) = state
            .agents
            .iter_mut()
            .find(|a| a.phone_number == phone_number)
        {
            agent.busy = false;
            debug!(agent = %phone_number, "agent released");
        }
    }

    pub fn available_count(&self) -> usize {
        self.state.lock().agents.iter().filter(|a| !a.busy).count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Both rosters together.
#[derive(Default)]
pub struct AgentRosters {
    pub inbound: Roster,
    pub outbound: Roster,
}

impl AgentRosters {
    pub fn roster(&self, kind: AgentKind) -> &Roster {
        match kind {
            AgentKind::Inbound => &self.inbound,
            AgentKind::Outbound => &self.outbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(numbers: &[&str]) -> Vec<(Option<i64>, String)> {
        numbers
            .iter()
            .enumerate()
            .map(|(i, n)| (Some(i as i64), n.to_string()))
            .collect()
    }

    #[test]
    fn round_robin_rotates() {
        let roster = Roster::default();
        roster.replace(batch(&["0911", "0912", "0913"]));
        let first = roster.acquire().unwrap();
        roster.release(&first.phone_number);
        let second = roster.acquire().unwrap();
        assert_ne!(first.phone_number, second.phone_number);
    }

    #[test]
    fn busy_agents_are_skipped() {
        let roster = Roster::default();
        roster.replace(batch(&["0911", "0912"]));
        let a = roster.acquire().unwrap();
        let b = roster.acquire().unwrap();
        assert_ne!(a.phone_number, b.phone_number);
        assert!(roster.acquire().is_none());
        roster.release(&a.phone_number);
        assert_eq!(roster.acquire().unwrap().phone_number, a.phone_number);
    }

    #[test]
    fn refresh_preserves_busy_flags() {
        let roster = Roster::default();
        roster.replace(batch(&["0911", "0912"]));
        let a = roster.acquire().unwrap();
        roster.replace(batch(&["0911", "0912", "0913"]));
        assert_eq!(roster.available_count(), 2);
        roster.release(&a.phone_number);
        assert_eq!(roster.available_count(), 3);
    }

    #[test]
    fn static_seed_yields_to_panel() {
        let roster = Roster::default();
        roster.seed_static(&["0999".into()]);
        assert_eq!(roster.len(), 1);
        roster.replace(batch(&["0911"]));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.acquire().unwrap().phone_number, "0911");
    }
}
