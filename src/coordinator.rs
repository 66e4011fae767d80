use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ConfigSource;
use crate::hub::BroadcastHub;
use crate::protocol::ServerEvent;

/// Barrier state for one sequence waiting on a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationEntry {
    pub step_id: String,
    pub ready: BTreeSet<String>,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceReason {
    Quorum,
    Deadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub sequence_id: String,
    pub step_id: String,
    pub reason: AdvanceReason,
}

impl Advance {
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::SequenceAdvance {
            sequence_id: self.sequence_id.clone(),
            step_id: self.step_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Nobody eligible is connected, or the report was malformed
    Ignored,
    /// Recorded; still waiting on other holders
    Waiting { ready: usize, expected: usize },
    /// The same holder reported the same step again
    Duplicate,
    Advanced(Advance),
}

/// Per-sequence barrier table.
///
/// Pure state machine: it never reads the clock or the connection registry
/// itself, callers pass `now` and the set of eligible holders.
#[derive(Debug, Clone)]
pub struct CoordinationTable {
    entries: HashMap<String, CoordinationEntry>,
    timeout_ms: u64,
}

impl CoordinationTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout_ms: timeout.as_millis().max(1) as u64,
        }
    }

    pub fn report_ready(
        &mut self,
        sequence_id: &str,
        step_id: &str,
        holder_id: &str,
        eligible: &BTreeSet<String>,
        now_ms: u64,
    ) -> ReadyOutcome {
        if sequence_id.is_empty() || step_id.is_empty() || holder_id.is_empty() {
            return ReadyOutcome::Ignored;
        }

        let replace = self
            .entries
            .get(sequence_id)
            .map(|entry| entry.step_id != step_id)
            .unwrap_or(true);

        if replace {
            if eligible.is_empty() {
                return ReadyOutcome::Ignored;
            }
            if let Some(old) = self.entries.remove(sequence_id) {
                debug!("Sequence {} moved on from step {} before quorum", sequence_id, old.step_id);
            }
            self.entries.insert(
                sequence_id.to_string(),
                CoordinationEntry {
                    step_id: step_id.to_string(),
                    ready: BTreeSet::new(),
                    deadline_ms: now_ms + self.timeout_ms,
                },
            );
        }

        let Some(entry) = self.entries.get_mut(sequence_id) else {
            return ReadyOutcome::Ignored;
        };
        if !entry.ready.insert(holder_id.to_string()) {
            return ReadyOutcome::Duplicate;
        }

        if quorum_reached(entry, eligible) {
            ReadyOutcome::Advanced(self.advance(sequence_id, AdvanceReason::Quorum))
        } else {
            ReadyOutcome::Waiting {
                ready: entry.ready.intersection(eligible).count(),
                expected: eligible.len(),
            }
        }
    }

    /// Advance every sequence whose deadline has passed
    pub fn fire_due(&mut self, now_ms: u64) -> Vec<Advance> {
        let mut due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now_ms >= entry.deadline_ms)
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        due.into_iter()
            .map(|id| self.advance(&id, AdvanceReason::Deadline))
            .collect()
    }

    /// Re-check quorum after the eligible sets changed.
    ///
    /// Entries whose sequence has nobody eligible left are discarded without
    /// an advance.
    pub fn reevaluate<F>(&mut self, eligible_for: F) -> Vec<Advance>
    where
        F: Fn(&str) -> BTreeSet<String>,
    {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();

        let mut advances = Vec::new();
        for id in ids {
            let eligible = eligible_for(&id);
            if eligible.is_empty() {
                self.entries.remove(&id);
                debug!("Dropping barrier for {}: no eligible display connected", id);
                continue;
            }
            let reached = self
                .entries
                .get(&id)
                .map(|entry| quorum_reached(entry, &eligible))
                .unwrap_or(false);
            if reached {
                advances.push(self.advance(&id, AdvanceReason::Quorum));
            }
        }
        advances
    }

    /// Close the barrier; the next report for this sequence opens a fresh one
    fn advance(&mut self, sequence_id: &str, reason: AdvanceReason) -> Advance {
        let step_id = self
            .entries
            .remove(sequence_id)
            .map(|entry| entry.step_id)
            .unwrap_or_default();
        Advance {
            sequence_id: sequence_id.to_string(),
            step_id,
            reason,
        }
    }

    pub fn pending(&self, sequence_id: &str) -> Option<&CoordinationEntry> {
        self.entries.get(sequence_id)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

fn quorum_reached(entry: &CoordinationEntry, eligible: &BTreeSet<String>) -> bool {
    !eligible.is_empty() && eligible.iter().all(|id| entry.ready.contains(id))
}

/// Server-side barrier for coordinated sequences.
///
/// Quorum is every connected display configured on the sequence. Reports are
/// answered immediately; advances go out to every client as `sequence_advance`.
pub struct PlaylistAdvanceCoordinator {
    table: Mutex<CoordinationTable>,
    hub: BroadcastHub,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
}

impl PlaylistAdvanceCoordinator {
    pub fn new(
        hub: BroadcastHub,
        config: Arc<dyn ConfigSource>,
        clock: Arc<dyn Clock>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            table: Mutex::new(CoordinationTable::new(step_timeout)),
            hub,
            config,
            clock,
        }
    }

    fn table(&self) -> MutexGuard<'_, CoordinationTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connected displays configured on `sequence_id`
    pub fn eligible_holders(&self, sequence_id: &str) -> BTreeSet<String> {
        let connected = self.hub.connected_displays();
        self.config
            .screens_on_sequence(sequence_id)
            .into_iter()
            .filter(|id| connected.contains(id))
            .collect()
    }

    pub fn report_ready(&self, sequence_id: &str, step_id: &str, holder_id: &str) -> ReadyOutcome {
        let eligible = self.eligible_holders(sequence_id);
        let now = self.clock.now_ms();
        let outcome = self
            .table()
            .report_ready(sequence_id, step_id, holder_id, &eligible, now);

        match &outcome {
            ReadyOutcome::Advanced(advance) => self.announce(advance),
            ReadyOutcome::Waiting { ready, expected } => {
                debug!(
                    "Sequence {} step {}: {}/{} displays ready",
                    sequence_id, step_id, ready, expected
                );
            }
            ReadyOutcome::Ignored => {
                debug!("Ignoring step_ready for {} from {}", sequence_id, holder_id);
            }
            ReadyOutcome::Duplicate => {}
        }
        outcome
    }

    /// Advance sequences whose barrier deadline elapsed
    pub fn fire_due(&self) -> Vec<Advance> {
        let now = self.clock.now_ms();
        let advances = self.table().fire_due(now);
        for advance in &advances {
            warn!(
                "Barrier for sequence {} step {} timed out, advancing without full quorum",
                advance.sequence_id, advance.step_id
            );
            self.announce(advance);
        }
        advances
    }

    /// Re-check pending barriers after a disconnect or a config change
    pub fn reevaluate(&self) -> Vec<Advance> {
        let advances = self
            .table()
            .reevaluate(|sequence_id| self.eligible_holders(sequence_id));
        for advance in &advances {
            self.announce(advance);
        }
        advances
    }

    fn announce(&self, advance: &Advance) {
        info!(
            "Advancing sequence {} past step {} ({:?})",
            advance.sequence_id, advance.step_id, advance.reason
        );
        self.hub.publish(advance.to_event());
    }

    pub fn pending_count(&self) -> usize {
        self.table().pending_count()
    }
}
