//! # Summary
//!
//! This module centralizes the Paxos state machine for all three roles.
//!
//! One peer owns one [`Instance`] at a time, guarded by a single lock so
//! that the acceptor invariants and the learner's quorum bookkeeping are
//! observed atomically. Proposer state lives only while a proposal is in
//! flight; acceptor and learner state persist for the life of the peer and
//! survive resets and failed attempts.

use std::fmt;
use std::time::Instant;

use hashbrown::HashMap as Map;
use hashbrown::HashSet as Set;
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::constants::MAX_HISTORY;
use crate::message::{MemberId, ProposalNumber};

/// Phase of the current consensus instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No active proposal.
    Idle,
    /// Sending PREPARE, collecting PROMISE.
    Phase1,
    /// Sending ACCEPT_REQUEST, collecting ACCEPTED.
    Phase2,
    /// Consensus reached.
    Decided,
    /// Proposal attempt failed; a retry may start over.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
        | Phase::Idle => f.write_str("IDLE"),
        | Phase::Phase1 => f.write_str("PHASE_1"),
        | Phase::Phase2 => f.write_str("PHASE_2"),
        | Phase::Decided => f.write_str("DECIDED"),
        | Phase::Failed => f.write_str("FAILED"),
        }
    }
}

/// A state transition was requested in a phase that does not allow it.
#[derive(Debug, Error)]
#[error("cannot start phase 1 from {phase}")]
pub struct IllegalPhase {
    pub phase: Phase,
}

/// Outcome of recording a PROMISE.
#[derive(Debug, PartialEq, Eq)]
pub enum PromiseOutcome {
    /// Not our proposal, or we are not in phase 1.
    Ignored,
    /// Recorded; still short of a majority.
    Recorded,
    /// Majority reached: proceed to phase 2 with this value.
    ReadyPhase2 {
        number: ProposalNumber,
        value: String,
    },
}

/// Outcome of processing an inbound ACCEPTED through both interested roles.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AcceptedOutcome {
    /// Set when our own proposal just crossed its quorum.
    pub proposer_decided: Option<(ProposalNumber, String)>,
    /// True when the learner just crossed a quorum of acceptors.
    pub newly_learned: bool,
}

/// Outcome of an acceptor-side PREPARE.
#[derive(Debug, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Promise, attaching the prior acceptance if one exists.
    Promise {
        prior: Option<(ProposalNumber, String)>,
    },
    /// Rejected silently; `promised` is the number that outranks it.
    Reject { promised: ProposalNumber },
}

/// Outcome of an acceptor-side ACCEPT_REQUEST.
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptRequestOutcome {
    Accepted,
    Reject { promised: ProposalNumber },
}

/// All mutable consensus state for one decree.
struct Instance {
    id: String,

    phase: Phase,

    /// Proposer: number and value of the active proposal.
    number: Option<ProposalNumber>,
    value: Option<String>,

    /// Proposer: peers that answered PREPARE with a PROMISE.
    promises: Set<MemberId>,

    /// Proposer: peers that answered ACCEPT_REQUEST with an ACCEPTED.
    accepts: Set<MemberId>,

    /// Proposer: highest prior acceptance carried by any PROMISE.
    adopted: Option<(ProposalNumber, String)>,

    /// Acceptor: highest proposal number promised so far.
    promised: Option<ProposalNumber>,

    /// Acceptor: highest proposal number accepted, and its value.
    accepted: Option<ProposalNumber>,
    accepted_value: Option<String>,

    /// Learner: acceptors seen per proposal number.
    accepted_by: Map<ProposalNumber, (String, Set<MemberId>)>,

    /// Learner: the decision, permanent once set.
    decided: Option<(ProposalNumber, String)>,

    last_activity: Instant,
}

impl Instance {
    fn new(id: String) -> Self {
        Instance {
            id,
            phase: Phase::Idle,
            number: None,
            value: None,
            promises: Set::new(),
            accepts: Set::new(),
            adopted: None,
            promised: None,
            accepted: None,
            accepted_value: None,
            accepted_by: Map::new(),
            decided: None,
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn decide(&mut self, number: ProposalNumber, value: String) {
        self.decided = Some((number, value));
        self.phase = Phase::Decided;
        self.touch();
    }
}

/// Owner of the current instance, serializing every role's transitions
/// behind one lock.
pub struct StateManager {
    id: MemberId,
    current: Mutex<Instance>,
    history: Mutex<Map<String, Instance>>,
}

impl StateManager {
    pub fn new(id: MemberId) -> Self {
        StateManager {
            id,
            current: Mutex::new(Instance::new("default".to_owned())),
            history: Mutex::new(Map::new()),
        }
    }

    // Proposer transitions

    /// Begin phase 1 with a fresh proposal. Valid only from IDLE or FAILED.
    pub fn start_phase1(
        &self,
        number: ProposalNumber,
        value: &str,
    ) -> Result<(), IllegalPhase> {
        let mut instance = self.current.lock();
        if instance.phase != Phase::Idle && instance.phase != Phase::Failed {
            return Err(IllegalPhase {
                phase: instance.phase,
            });
        }
        instance.number = Some(number);
        instance.value = Some(value.to_owned());
        instance.promises.clear();
        instance.accepts.clear();
        instance.adopted = None;
        instance.phase = Phase::Phase1;
        instance.touch();
        Ok(())
    }

    /// Record a PROMISE answering `number`. On reaching a majority the
    /// proposal moves to phase 2, adopting the value attached to the
    /// numerically highest prior acceptance if any promise carried one.
    pub fn on_promise(
        &self,
        sender: &MemberId,
        number: ProposalNumber,
        prior: Option<(ProposalNumber, String)>,
        quorum: usize,
    ) -> PromiseOutcome {
        let mut instance = self.current.lock();
        if instance.phase != Phase::Phase1 || instance.number != Some(number) {
            return PromiseOutcome::Ignored;
        }

        instance.promises.insert(sender.clone());
        if let Some((prior_number, prior_value)) = prior {
            let higher = instance
                .adopted
                .as_ref()
                .map_or(true, |(adopted, _)| prior_number > *adopted);
            if higher {
                instance.adopted = Some((prior_number, prior_value));
            }
        }
        instance.touch();

        if instance.promises.len() < quorum {
            return PromiseOutcome::Recorded;
        }

        if let Some((_, adopted_value)) = instance.adopted.clone() {
            info!("{} adopting previously accepted value `{}`", self.id, adopted_value);
            instance.value = Some(adopted_value);
        }
        instance.phase = Phase::Phase2;
        PromiseOutcome::ReadyPhase2 {
            number,
            value: instance.value.clone().unwrap_or_default(),
        }
    }

    /// Process an inbound ACCEPTED for both the proposer and the learner
    /// under a single lock acquisition.
    pub fn on_accepted(
        &self,
        sender: &MemberId,
        number: ProposalNumber,
        value: &str,
        quorum: usize,
    ) -> AcceptedOutcome {
        let mut instance = self.current.lock();
        let mut outcome = AcceptedOutcome::default();

        // Proposer: count responses to our own accept request.
        if instance.phase == Phase::Phase2 && instance.number == Some(number) {
            instance.accepts.insert(sender.clone());
            instance.touch();
            if instance.accepts.len() >= quorum && instance.decided.is_none() {
                let decided_value = instance.value.clone().unwrap_or_default();
                instance.decide(number, decided_value.clone());
                outcome.proposer_decided = Some((number, decided_value));
            }
        }

        // Learner: track which acceptors stand behind each number.
        let entry = instance
            .accepted_by
            .entry(number)
            .or_insert_with(|| (value.to_owned(), Set::new()));
        if entry.0 != value {
            warn!(
                "{} conflicting values for proposal {}: `{}` vs `{}`",
                self.id, number, entry.0, value,
            );
            return outcome;
        }
        entry.1.insert(sender.clone());
        let backers = entry.1.len();
        instance.touch();

        if backers >= quorum && instance.decided.is_none() {
            instance.decide(number, value.to_owned());
            outcome.newly_learned = true;
        }
        outcome
    }

    /// Mark the attempt FAILED if `number` is still the one in flight.
    /// Returns true when the phase actually changed.
    pub fn on_timeout(&self, number: ProposalNumber) -> bool {
        let mut instance = self.current.lock();
        let in_flight = matches!(instance.phase, Phase::Phase1 | Phase::Phase2);
        if in_flight && instance.number == Some(number) {
            instance.phase = Phase::Failed;
            instance.touch();
            return true;
        }
        false
    }

    // Acceptor transitions

    /// PREPARE: promise iff `number` strictly exceeds the highest promise.
    pub fn on_prepare(&self, number: ProposalNumber) -> PrepareOutcome {
        let mut instance = self.current.lock();
        let outranked = instance.promised.is_some_and(|promised| number <= promised);
        if outranked {
            return PrepareOutcome::Reject {
                promised: instance.promised.expect("reject implies a promise"),
            };
        }
        instance.promised = Some(number);
        instance.touch();
        let prior = instance
            .accepted
            .zip(instance.accepted_value.clone());
        PrepareOutcome::Promise { prior }
    }

    /// ACCEPT_REQUEST: accept iff `number` is at least the highest promise,
    /// raising both the promise and the acceptance watermarks.
    pub fn on_accept_request(&self, number: ProposalNumber, value: &str) -> AcceptRequestOutcome {
        let mut instance = self.current.lock();
        let outranked = instance.promised.is_some_and(|promised| number < promised);
        if outranked {
            return AcceptRequestOutcome::Reject {
                promised: instance.promised.expect("reject implies a promise"),
            };
        }
        instance.promised = Some(number);
        instance.accepted = Some(number);
        instance.accepted_value = Some(value.to_owned());
        instance.touch();
        AcceptRequestOutcome::Accepted
    }

    // Learner transitions

    /// Force-learn a decision announced by a LEARN broadcast. Returns true
    /// the first time only; the decision never changes afterwards.
    pub fn force_learn(&self, number: ProposalNumber, value: &str) -> bool {
        let mut instance = self.current.lock();
        instance
            .accepted_by
            .entry(number)
            .or_insert_with(|| (value.to_owned(), Set::new()));
        if instance.decided.is_some() {
            return false;
        }
        instance.decide(number, value.to_owned());
        true
    }

    // Lifecycle

    /// Clear proposer state and return to IDLE, unless already decided.
    /// Acceptor and learner state are deliberately preserved.
    pub fn reset(&self) {
        let mut instance = self.current.lock();
        if instance.phase == Phase::Decided {
            return;
        }
        instance.phase = Phase::Idle;
        instance.number = None;
        instance.value = None;
        instance.promises.clear();
        instance.accepts.clear();
        instance.adopted = None;
        debug!("{} proposer state reset", self.id);
    }

    /// Archive the current instance and install a fresh one. Hook for the
    /// multi-decree façade; single-decree operation never calls this.
    pub fn begin_new_round(&self, round_id: String) {
        let mut history = self.history.lock();
        let mut current = self.current.lock();
        let previous = std::mem::replace(&mut *current, Instance::new(round_id));
        history.insert(previous.id.clone(), previous);

        while history.len() > MAX_HISTORY {
            let oldest = history
                .iter()
                .min_by_key(|(_, instance)| instance.last_activity)
                .map(|(id, _)| id.clone());
            match oldest {
            | Some(id) => history.remove(&id),
            | None => break,
            };
        }
    }

    // Queries

    pub fn phase(&self) -> Phase {
        self.current.lock().phase
    }

    pub fn current_number(&self) -> Option<ProposalNumber> {
        self.current.lock().number
    }

    pub fn has_learned(&self) -> bool {
        self.current.lock().decided.is_some()
    }

    pub fn learned(&self) -> Option<(ProposalNumber, String)> {
        self.current.lock().decided.clone()
    }

    pub fn promised(&self) -> Option<ProposalNumber> {
        self.current.lock().promised
    }

    pub fn accepted(&self) -> Option<(ProposalNumber, String)> {
        let instance = self.current.lock();
        instance.accepted.zip(instance.accepted_value.clone())
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Human-readable state block for the stats surface.
    pub fn status(&self) -> String {
        let instance = self.current.lock();
        let show_number = |number: &Option<ProposalNumber>| match number {
        | Some(number) => number.to_string(),
        | None => "None".to_owned(),
        };
        let show_value = |value: &Option<String>| match value {
        | Some(value) => value.clone(),
        | None => "None".to_owned(),
        };
        format!(
            "Member {} State:\n  \
             Instance: {}\n  \
             Phase: {}\n  \
             Proposal: {} -> {}\n  \
             Promises: {}, Accepts: {}\n  \
             Promised: {}, Accepted: {} -> {}\n  \
             Decided: {} (proposal {})\n  \
             Last Activity: {}ms ago",
            self.id,
            instance.id,
            instance.phase,
            show_number(&instance.number),
            show_value(&instance.value),
            instance.promises.len(),
            instance.accepts.len(),
            show_number(&instance.promised),
            show_number(&instance.accepted),
            show_value(&instance.accepted_value),
            show_value(&instance.decided.as_ref().map(|(_, value)| value.clone())),
            show_number(&instance.decided.as_ref().map(|(number, _)| *number)),
            instance.last_activity.elapsed().as_millis(),
        )
    }
}
