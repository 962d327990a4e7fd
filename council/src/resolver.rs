//! # Summary
//!
//! This module detects and defuses duelling proposers.
//!
//! Every proposal attempt, our own and those inferred from observed
//! PREPARE and ACCEPT_REQUEST traffic, is tracked in a sliding window. A
//! new attempt runs through an ordered list of strategies; the first
//! strategy with a verdict other than CONTINUE wins. Losing attempts back
//! off exponentially with jitter, and repeated conflicts make the next
//! proposal number jump ahead by a random amount so rivals stop trading
//! one-higher numbers forever.

use std::fmt;
use std::time::{Duration, Instant};

use hashbrown::HashMap as Map;
use log::debug;
use parking_lot::Mutex;
use rand::Rng;

use crate::constants::{
    BACKOFF_MULTIPLIER, CONCURRENCY_WINDOW, CONFLICT_WINDOW, MAX_BACKOFF_MS, MIN_BACKOFF_MS,
};
use crate::message::{MemberId, ProposalNumber};
use crate::SharedRng;

/// Where an attempt currently stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttemptStatus {
    /// Sending PREPARE messages.
    Preparing,
    /// Sending ACCEPT_REQUEST messages.
    Accepting,
    Succeeded,
    Failed,
    /// Lost a conflict-resolution round.
    Conflicted,
}

/// One proposal attempt inside the detection window.
#[derive(Clone, Debug)]
pub struct Attempt {
    pub number: ProposalNumber,
    pub member: MemberId,
    pub started: Instant,
    pub status: AttemptStatus,
}

impl Attempt {
    fn is_active(&self) -> bool {
        matches!(self.status, AttemptStatus::Preparing | AttemptStatus::Accepting)
    }

    fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

/// What to do about a freshly registered attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed with the proposal.
    Continue,
    /// Retry after a backoff delay.
    Backoff,
    /// Give up on this attempt entirely.
    Abort,
    /// Defer to a higher-priority rival.
    Yield,
    /// Proceed, bumping priority on the next attempt.
    Escalate,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
        | Verdict::Continue => f.write_str("CONTINUE"),
        | Verdict::Backoff => f.write_str("BACKOFF"),
        | Verdict::Abort => f.write_str("ABORT"),
        | Verdict::Yield => f.write_str("YIELD"),
        | Verdict::Escalate => f.write_str("ESCALATE"),
        }
    }
}

/// A single conflict-resolution rule. Evaluated in order; the first
/// non-CONTINUE verdict wins.
pub type Strategy = fn(&Attempt, &[Attempt]) -> Verdict;

/// Rivals with strictly greater numbers outrank us.
fn yield_to_higher(mine: &Attempt, conflicts: &[Attempt]) -> Verdict {
    for conflict in conflicts {
        if conflict.number > mine.number {
            return Verdict::Yield;
        }
    }
    Verdict::Continue
}

/// Equal numbers cannot happen under the ordinal tiebreak, but if they do,
/// the lower ordinal wins and we back off.
fn ordinal_tiebreak(mine: &Attempt, conflicts: &[Attempt]) -> Verdict {
    for conflict in conflicts {
        if conflict.number == mine.number && conflict.member.ordinal() < mine.member.ordinal() {
            return Verdict::Backoff;
        }
    }
    Verdict::Continue
}

/// Three or more concurrent rivals is a stampede; stand aside.
fn crowd_backoff(_: &Attempt, conflicts: &[Attempt]) -> Verdict {
    if conflicts.len() >= 3 {
        return Verdict::Backoff;
    }
    Verdict::Continue
}

/// Rivals that started well before us get a chance to finish.
fn elder_priority(mine: &Attempt, conflicts: &[Attempt]) -> Verdict {
    for conflict in conflicts {
        if conflict.started + Duration::from_secs(1) <= mine.started {
            return Verdict::Backoff;
        }
    }
    Verdict::Continue
}

const DEFAULT_STRATEGIES: [Strategy; 4] =
    [yield_to_higher, ordinal_tiebreak, crowd_backoff, elder_priority];

/// Tracks recent proposal attempts and arbitrates between them.
pub struct ConflictResolver {
    id: MemberId,
    attempts: Mutex<Map<ProposalNumber, Attempt>>,
    strategies: Mutex<Vec<Strategy>>,
    backoff_ms: Mutex<u64>,
    last_proposal: Mutex<Option<Instant>>,
    rng: SharedRng,
}

impl ConflictResolver {
    pub fn new(id: MemberId, rng: SharedRng) -> Self {
        ConflictResolver {
            id,
            attempts: Mutex::new(Map::new()),
            strategies: Mutex::new(DEFAULT_STRATEGIES.to_vec()),
            backoff_ms: Mutex::new(MIN_BACKOFF_MS),
            last_proposal: Mutex::new(None),
            rng,
        }
    }

    /// Record one of our own attempts.
    pub fn register(&self, number: ProposalNumber) -> Attempt {
        let attempt = Attempt {
            number,
            member: self.id.clone(),
            started: Instant::now(),
            status: AttemptStatus::Preparing,
        };
        self.attempts.lock().insert(number, attempt.clone());
        *self.last_proposal.lock() = Some(attempt.started);
        debug!("{} registered proposal {}", self.id, number);
        attempt
    }

    /// Record a rival attempt inferred from observed traffic.
    pub fn observe(&self, number: ProposalNumber, member: MemberId, status: AttemptStatus) {
        if member == self.id {
            return;
        }
        let mut attempts = self.attempts.lock();
        attempts
            .entry(number)
            .and_modify(|attempt| attempt.status = status)
            .or_insert_with(|| Attempt {
                number,
                member,
                started: Instant::now(),
                status,
            });
    }

    /// Rival attempts that overlap ours: foreign, still active, inside the
    /// detection window, and started within the concurrency window of us.
    pub fn conflicts_with(&self, mine: &Attempt) -> Vec<Attempt> {
        let conflicts: Vec<Attempt> = self
            .attempts
            .lock()
            .values()
            .filter(|attempt| attempt.member != self.id)
            .filter(|attempt| attempt.age() <= CONFLICT_WINDOW)
            .filter(|attempt| attempt.is_active() && mine.is_active())
            .filter(|attempt| {
                let gap = if attempt.started > mine.started {
                    attempt.started - mine.started
                } else {
                    mine.started - attempt.started
                };
                gap < CONCURRENCY_WINDOW
            })
            .cloned()
            .collect();

        if !conflicts.is_empty() {
            debug!("{} detected {} conflicting proposals", self.id, conflicts.len());
        }
        conflicts
    }

    /// Run the strategy chain over a detected conflict set.
    pub fn resolve(&self, mine: &Attempt, conflicts: &[Attempt]) -> Verdict {
        if conflicts.is_empty() {
            return Verdict::Continue;
        }
        for strategy in self.strategies.lock().iter() {
            let verdict = strategy(mine, conflicts);
            if verdict != Verdict::Continue {
                debug!("{} conflict resolution: {}", self.id, verdict);
                return verdict;
            }
        }
        Verdict::Continue
    }

    /// Next backoff delay: exponential growth with jitter, capped.
    pub fn backoff_delay(&self) -> Duration {
        let mut current = self.backoff_ms.lock();
        let jitter = self.rng.lock().gen_range(0..=*current / 2);
        let delay = *current + jitter;
        *current = ((*current as f64 * BACKOFF_MULTIPLIER) as u64).min(MAX_BACKOFF_MS);
        debug!("{} backing off for {}ms", self.id, delay);
        Duration::from_millis(delay)
    }

    /// A successful decision resets the backoff to its floor.
    pub fn reset_backoff(&self) {
        *self.backoff_ms.lock() = MIN_BACKOFF_MS;
    }

    pub fn current_backoff_ms(&self) -> u64 {
        *self.backoff_ms.lock()
    }

    /// Update the status of a tracked attempt.
    pub fn mark(&self, number: ProposalNumber, status: AttemptStatus) {
        if let Some(attempt) = self.attempts.lock().get_mut(&number) {
            attempt.status = status;
        }
    }

    /// Attempts that lost a conflict round in the last few seconds.
    fn recent_conflicts(&self) -> usize {
        self.attempts
            .lock()
            .values()
            .filter(|attempt| attempt.status == AttemptStatus::Conflicted)
            .filter(|attempt| attempt.age() < Duration::from_secs(5))
            .count()
    }

    /// Build the next proposal number from a counter base, jumping ahead by
    /// a random amount when we have been losing conflicts. The caller folds
    /// the result back into its counter so numbers stay strictly monotonic.
    pub fn next_number(&self, base: u64) -> ProposalNumber {
        let mut counter = base;
        if self.recent_conflicts() > 0 {
            counter += self.rng.lock().gen_range(1..=10);
        }
        ProposalNumber::new(counter, self.id.ordinal())
    }

    /// Drop attempts that have aged out of the detection window.
    pub fn prune(&self) {
        self.attempts
            .lock()
            .retain(|_, attempt| attempt.age() <= CONFLICT_WINDOW);
    }

    /// Install an extra strategy at the end of the chain.
    pub fn add_strategy(&self, strategy: Strategy) {
        self.strategies.lock().push(strategy);
    }

    /// Restore the default strategy chain.
    pub fn reset_strategies(&self) {
        *self.strategies.lock() = DEFAULT_STRATEGIES.to_vec();
    }

    /// Human-readable summary for the stats surface.
    pub fn status(&self) -> String {
        let attempts = self.attempts.lock();
        let active = attempts.values().filter(|attempt| attempt.is_active()).count();
        let conflicted = attempts
            .values()
            .filter(|attempt| attempt.status == AttemptStatus::Conflicted)
            .count();
        let since_last = self
            .last_proposal
            .lock()
            .map(|at| format!("{}ms ago", at.elapsed().as_millis()))
            .unwrap_or_else(|| "never".to_owned());
        format!(
            "Conflict Statistics for {}:\n  \
             Active Proposals: {}\n  \
             Recent Conflicts: {}\n  \
             Current Backoff: {}ms\n  \
             Last Proposal: {}",
            self.id,
            active,
            conflicted,
            self.current_backoff_ms(),
            since_last,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn resolver(ordinal: u32) -> ConflictResolver {
        let rng: SharedRng = Arc::new(Mutex::new(StdRng::seed_from_u64(7)));
        ConflictResolver::new(MemberId::from_ordinal(ordinal), rng)
    }

    fn n(counter: u64, ordinal: u32) -> ProposalNumber {
        ProposalNumber::new(counter, ordinal)
    }

    #[test]
    fn no_conflicts_means_continue() {
        let resolver = resolver(5);
        let mine = resolver.register(n(1, 5));
        let conflicts = resolver.conflicts_with(&mine);
        assert!(conflicts.is_empty());
        assert_eq!(resolver.resolve(&mine, &conflicts), Verdict::Continue);
    }

    #[test]
    fn yields_to_higher_numbered_rival() {
        let resolver = resolver(5);
        resolver.observe(n(9, 2), MemberId::from_ordinal(2), AttemptStatus::Preparing);
        let mine = resolver.register(n(3, 5));
        let conflicts = resolver.conflicts_with(&mine);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(resolver.resolve(&mine, &conflicts), Verdict::Yield);
    }

    #[test]
    fn lower_numbered_rival_is_not_a_blocker() {
        let resolver = resolver(5);
        resolver.observe(n(1, 2), MemberId::from_ordinal(2), AttemptStatus::Preparing);
        let mine = resolver.register(n(3, 5));
        let conflicts = resolver.conflicts_with(&mine);
        assert_eq!(resolver.resolve(&mine, &conflicts), Verdict::Continue);
    }

    #[test]
    fn crowd_of_rivals_forces_backoff() {
        let resolver = resolver(9);
        for ordinal in 2..=4 {
            resolver.observe(
                n(1, ordinal),
                MemberId::from_ordinal(ordinal),
                AttemptStatus::Preparing,
            );
        }
        let mine = resolver.register(n(2, 9));
        let conflicts = resolver.conflicts_with(&mine);
        assert_eq!(conflicts.len(), 3);
        assert_eq!(resolver.resolve(&mine, &conflicts), Verdict::Backoff);
    }

    #[test]
    fn own_attempts_never_conflict() {
        let resolver = resolver(5);
        resolver.register(n(1, 5));
        let mine = resolver.register(n(2, 5));
        assert!(resolver.conflicts_with(&mine).is_empty());
    }

    #[test]
    fn settled_rivals_do_not_conflict() {
        let resolver = resolver(5);
        resolver.observe(n(9, 2), MemberId::from_ordinal(2), AttemptStatus::Preparing);
        resolver.mark(n(9, 2), AttemptStatus::Succeeded);
        let mine = resolver.register(n(3, 5));
        assert!(resolver.conflicts_with(&mine).is_empty());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let resolver = resolver(5);
        let first = resolver.backoff_delay();
        assert!(first >= Duration::from_millis(MIN_BACKOFF_MS));

        for _ in 0..20 {
            resolver.backoff_delay();
        }
        assert_eq!(resolver.current_backoff_ms(), MAX_BACKOFF_MS);

        resolver.reset_backoff();
        assert_eq!(resolver.current_backoff_ms(), MIN_BACKOFF_MS);
    }

    #[test]
    fn conflict_aware_numbers_jump_ahead() {
        let resolver = resolver(5);
        assert_eq!(resolver.next_number(4), n(4, 5));

        let mine = resolver.register(n(4, 5));
        resolver.mark(mine.number, AttemptStatus::Conflicted);
        let bumped = resolver.next_number(5);
        assert!(bumped.counter > 5);
        assert!(bumped.counter <= 15);
        assert_eq!(bumped.ordinal, 5);
    }

    #[test]
    fn prune_discards_nothing_fresh() {
        let resolver = resolver(5);
        resolver.register(n(1, 5));
        resolver.prune();
        assert_eq!(resolver.status().contains("Active Proposals: 1"), true);
    }
}
