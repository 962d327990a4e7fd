//! # Summary
//!
//! This module implements the participant façade: one peer acting as
//! proposer, acceptor, and learner at once.
//!
//! The façade owns the transport, the network-behavior model, the state
//! manager, and the conflict resolver, and wires them together: inbound
//! lines flow through the listener into the internal queue, a single
//! dispatch task drains the queue in arrival order and drives the state
//! machine, and every outbound message passes through the simulator's
//! per-send decision before it touches a socket.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::Membership;
use crate::constants::{CONFLICT_WINDOW, LEARN_REBROADCAST, PHASE_TIMEOUT};
use crate::internal;
use crate::message::{self, Kind, MemberId, PaxosMessage, ProposalNumber};
use crate::resolver::{AttemptStatus, ConflictResolver, Verdict};
use crate::scenario::{ActionKind, Scenario};
use crate::sim::{NetworkEvent, NetworkSimulator, Profile};
use crate::socket::Transport;
use crate::state::{
    AcceptRequestOutcome, Phase, PrepareOutcome, PromiseOutcome, StateManager,
};
use crate::SharedRng;

/// Why a proposal was not started.
#[derive(Debug, Error)]
pub enum ProposeError {
    #[error("value is empty or contains a reserved character")]
    InvalidValue,
    #[error("consensus already reached on `{0}`")]
    AlreadyDecided(String),
    #[error("a proposal is already in flight")]
    InFlight,
    #[error("yielding to a higher-priority proposal")]
    Yielded,
    #[error("aborted due to conflicting proposals")]
    Aborted,
    #[error("backing off for {}ms before retrying", .0.as_millis())]
    BackedOff(Duration),
}

struct Inner {
    id: MemberId,
    membership: Arc<Membership>,
    quorum: usize,
    transport: Transport,
    sim: Arc<NetworkSimulator>,
    state: StateManager,
    resolver: ConflictResolver,
    counter: AtomicU64,
    round: AtomicU64,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    rng: SharedRng,
}

/// A council member: the integrated Paxos participant.
#[derive(Clone)]
pub struct Participant {
    inner: Arc<Inner>,
}

impl Participant {
    /// Build a participant. `seed` makes every stochastic decision of this
    /// peer reproducible; `None` seeds from the OS.
    pub fn new(
        id: MemberId,
        membership: Membership,
        profile: Profile,
        seed: Option<u64>,
    ) -> Self {
        let membership = Arc::new(membership);
        let rng: SharedRng = Arc::new(Mutex::new(match seed {
        | Some(seed) => StdRng::seed_from_u64(seed),
        | None => StdRng::from_entropy(),
        }));

        let inner = Inner {
            id: id.clone(),
            quorum: membership.majority(),
            transport: Transport::new(id.clone(), Arc::clone(&membership)),
            sim: NetworkSimulator::new(id.clone(), profile, Arc::clone(&rng)),
            state: StateManager::new(id.clone()),
            resolver: ConflictResolver::new(id, Arc::clone(&rng)),
            counter: AtomicU64::new(0),
            round: AtomicU64::new(0),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            rng,
            membership,
        };
        Participant {
            inner: Arc::new(inner),
        }
    }

    /// Bind the listener and start the dispatch and timer tasks.
    pub async fn start(&self, port: u16) -> io::Result<()> {
        let inner = &self.inner;
        let (rx, tx) = internal::new();

        let listener = inner.transport.listen(port, tx).await?;
        inner.running.store(true, Ordering::SeqCst);

        let dispatcher = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let mut rx = rx;
                while let Some(message) = rx.recv().await {
                    Inner::on_inbound(&inner, message);
                }
            })
        };

        inner.sim.spawn_timers();

        let pruner = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(CONFLICT_WINDOW);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    inner.resolver.prune();
                }
            })
        };

        // Re-announce the decision so peers cut off at decision time still
        // converge once they become reachable again.
        let announcer = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(LEARN_REBROADCAST);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Some((number, value)) = inner.state.learned() {
                        let learn = PaxosMessage::new(
                            Kind::Learn,
                            inner.id.clone(),
                            number,
                            Some(value),
                        );
                        Inner::broadcast_simulated(&inner, learn);
                    }
                }
            })
        };

        let mut tasks = inner.tasks.lock();
        tasks.push(listener);
        tasks.push(dispatcher);
        tasks.push(pruner);
        tasks.push(announcer);

        info!("{} started and ready for election", inner.id);
        Ok(())
    }

    /// Propose a value for the current decree.
    pub fn propose(&self, value: &str) -> Result<ProposalNumber, ProposeError> {
        Inner::propose(&self.inner, value)
    }

    /// Signal every task to stop and deactivate the network model.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        inner.sim.shutdown();
        info!("{} stopped", inner.id);
    }

    /// Clear proposer state; acceptor and learner state persist.
    pub fn reset(&self) {
        self.inner.state.reset();
        self.inner.resolver.reset_strategies();
    }

    /// Archive the decided instance and open a fresh round. Multi-decree
    /// hook; does nothing until a decision exists.
    pub fn begin_new_round(&self) {
        if !self.inner.state.has_learned() {
            info!("{} has no decision to archive yet", self.inner.id);
            return;
        }
        let round = self.inner.round.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.begin_new_round(format!("round-{}", round));
        info!("{} starting new round {}", self.inner.id, round);
    }

    pub fn has_learned(&self) -> bool {
        self.inner.state.has_learned()
    }

    pub fn learned_value(&self) -> Option<String> {
        self.inner.state.learned().map(|(_, value)| value)
    }

    pub fn id(&self) -> &MemberId {
        &self.inner.id
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.phase()
    }

    pub fn messages_sent(&self) -> u64 {
        self.inner.sim.messages_sent()
    }

    pub fn messages_lost(&self) -> u64 {
        self.inner.sim.messages_lost()
    }

    pub fn set_profile(&self, profile: Profile) {
        self.inner.sim.set_profile(profile);
    }

    pub fn partition(&self, peers: Vec<MemberId>, duration: Duration) {
        self.inner.sim.simulate_partition(peers, duration);
    }

    pub fn offline(&self, duration: Duration) {
        self.inner.sim.simulate_offline(duration);
    }

    pub fn recent_events(&self, count: usize) -> Vec<NetworkEvent> {
        self.inner.sim.recent_events(count)
    }

    /// Detailed state block: consensus, network, and conflict views.
    pub fn status(&self) -> String {
        let inner = &self.inner;
        let mut status = format!("=== {} State ===\n", inner.id);
        status.push_str(&inner.state.status());
        status.push_str("\n\nNetwork Simulation:\n");
        status.push_str(&inner.sim.stats().to_string());
        status.push_str("\n\n");
        status.push_str(&inner.resolver.status());
        status.push_str("\n\nRecent Network Events:\n");
        for event in inner.sim.recent_events(5) {
            status.push_str(&format!("  {}\n", event));
        }
        status
    }

    /// Compact performance metrics.
    pub fn metrics(&self) -> String {
        let inner = &self.inner;
        let stats = inner.sim.stats();
        format!(
            "Performance Metrics for {}:\n  \
             Total Messages: {}\n  \
             Lost Messages: {} ({:.2}%)\n  \
             Current Profile: {}\n  \
             Current Condition: {}\n  \
             Paxos Phase: {}\n  \
             Has Learned: {}",
            inner.id,
            stats.messages_sent,
            stats.messages_lost,
            stats.loss_rate * 100.0,
            stats.profile,
            stats.condition,
            inner.state.phase(),
            inner.state.has_learned(),
        )
    }

    /// Activate a named scenario: apply the profile override for this peer
    /// and schedule the actions that target it. Returns false for unknown
    /// scenario names.
    pub fn activate_scenario(&self, name: &str) -> bool {
        let Some(scenario) = Scenario::by_name(name) else {
            return false;
        };
        let inner = &self.inner;
        info!("{} activating scenario: {}", inner.id, scenario.name);
        info!("{} scenario description: {}", inner.id, scenario.description);

        for (target, profile) in &scenario.profiles {
            if *target == inner.id {
                inner.sim.set_profile(*profile);
            }
        }

        for action in scenario.actions.iter().filter(|action| action.target == inner.id) {
            let inner = Arc::clone(inner);
            let kind = action.kind.clone();
            let delay = action.delay;
            Inner::track(&self.inner, tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !inner.running.load(Ordering::SeqCst) {
                    return;
                }
                match kind {
                | ActionKind::ChangeProfile(profile) => inner.sim.set_profile(profile),
                | ActionKind::Partition { peers, duration } => {
                    inner.sim.simulate_partition(peers, duration);
                }
                | ActionKind::Offline(duration) => inner.sim.simulate_offline(duration),
                | ActionKind::Crash => {
                    let down = 5000 + inner.rng.lock().gen_range(0..10000);
                    info!("{} simulating crash", inner.id);
                    inner.sim.simulate_offline(Duration::from_millis(down));
                }
                }
            }));
        }

        // Revert to the configured profile when the scenario runs out.
        let configured = inner
            .membership
            .get(&inner.id)
            .map(|member| member.profile)
            .unwrap_or(Profile::Standard);
        let duration = scenario.duration;
        let end = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if !inner.running.load(Ordering::SeqCst) {
                    return;
                }
                info!("{} scenario ended, back to {}", inner.id, configured);
                inner.sim.set_profile(configured);
            })
        };
        Inner::track(inner, end);
        true
    }
}

impl Inner {
    fn propose(inner: &Arc<Inner>, value: &str) -> Result<ProposalNumber, ProposeError> {
        message::validate_value(value).map_err(|_| ProposeError::InvalidValue)?;

        if let Some((_, learned)) = inner.state.learned() {
            info!("{} cannot propose, consensus already reached: {}", inner.id, learned);
            return Err(ProposeError::AlreadyDecided(learned));
        }
        if matches!(inner.state.phase(), Phase::Phase1 | Phase::Phase2) {
            info!("{} already has an active proposal", inner.id);
            return Err(ProposeError::InFlight);
        }

        // Allocate a strictly increasing number, folding any conflict-aware
        // jump back into the counter.
        let base = inner.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let number = inner.resolver.next_number(base);
        inner.counter.fetch_max(number.counter, Ordering::SeqCst);

        let attempt = inner.resolver.register(number);
        let conflicts = inner.resolver.conflicts_with(&attempt);
        match inner.resolver.resolve(&attempt, &conflicts) {
        | Verdict::Continue | Verdict::Escalate => (),
        | Verdict::Yield => {
            inner.resolver.mark(number, AttemptStatus::Conflicted);
            info!("{} yielding to higher priority proposals", inner.id);
            return Err(ProposeError::Yielded);
        }
        | Verdict::Abort => {
            inner.resolver.mark(number, AttemptStatus::Conflicted);
            info!("{} aborting proposal due to conflicts", inner.id);
            return Err(ProposeError::Aborted);
        }
        | Verdict::Backoff => {
            inner.resolver.mark(number, AttemptStatus::Conflicted);
            let delay = inner.resolver.backoff_delay();
            Inner::schedule_retry(inner, value.to_owned(), delay);
            return Err(ProposeError::BackedOff(delay));
        }
        }

        if let Err(error) = inner.state.start_phase1(number, value) {
            warn!("{} dropped proposal: {}", inner.id, error);
            return Err(ProposeError::InFlight);
        }

        info!("{} proposing `{}` with proposal number {}", inner.id, value, number);
        Inner::arm_timeout(inner, number, value.to_owned());

        let prepare = PaxosMessage::new(Kind::Prepare, inner.id.clone(), number, None);
        Inner::broadcast_simulated(inner, prepare);
        Ok(number)
    }

    /// Route one inbound message through the state machine, emitting
    /// whatever the protocol calls for. Runs on the dispatch task, so
    /// messages are processed in arrival order.
    fn on_inbound(inner: &Arc<Inner>, message: PaxosMessage) {
        let PaxosMessage {
            kind,
            sender,
            number,
            value,
            prior,
        } = message;

        match kind {
        | Kind::Prepare => {
            inner.resolver.observe(number, sender.clone(), AttemptStatus::Preparing);
            match inner.state.on_prepare(number) {
            | PrepareOutcome::Promise { prior } => {
                debug!("{} promising to {} for proposal {}", inner.id, sender, number);
                let promise = PaxosMessage::promise(inner.id.clone(), number, prior);
                Inner::send_simulated(inner, sender, promise);
            }
            | PrepareOutcome::Reject { promised } => {
                debug!(
                    "{} rejecting PREPARE from {} ({} <= {})",
                    inner.id, sender, number, promised,
                );
            }
            }
        }
        | Kind::Promise => {
            if !inner.membership.contains(&sender) {
                debug!("{} ignoring PROMISE from unknown sender {}", inner.id, sender);
                return;
            }
            match inner.state.on_promise(&sender, number, prior, inner.quorum) {
            | PromiseOutcome::ReadyPhase2 { number, value } => {
                info!("{} received majority promises, entering phase 2", inner.id);
                inner.resolver.mark(number, AttemptStatus::Accepting);
                let request = PaxosMessage::new(
                    Kind::AcceptRequest,
                    inner.id.clone(),
                    number,
                    Some(value),
                );
                Inner::broadcast_simulated(inner, request);
            }
            | PromiseOutcome::Recorded | PromiseOutcome::Ignored => (),
            }
        }
        | Kind::AcceptRequest => {
            let Some(value) = value else {
                warn!("{} ACCEPT_REQUEST from {} without a value", inner.id, sender);
                return;
            };
            inner.resolver.observe(number, sender.clone(), AttemptStatus::Accepting);
            match inner.state.on_accept_request(number, &value) {
            | AcceptRequestOutcome::Accepted => {
                debug!("{} accepting proposal {} with value {}", inner.id, number, value);
                let accepted = PaxosMessage::new(
                    Kind::Accepted,
                    inner.id.clone(),
                    number,
                    Some(value),
                );
                // Satisfy the proposer, then notify every learner.
                Inner::send_simulated(inner, sender, accepted.clone());
                Inner::broadcast_simulated(inner, accepted);
            }
            | AcceptRequestOutcome::Reject { promised } => {
                debug!(
                    "{} rejecting ACCEPT_REQUEST from {} ({} < {})",
                    inner.id, sender, number, promised,
                );
            }
            }
        }
        | Kind::Accepted => {
            let Some(value) = value else {
                warn!("{} ACCEPTED from {} without a value", inner.id, sender);
                return;
            };
            if !inner.membership.contains(&sender) {
                debug!("{} ignoring ACCEPTED from unknown sender {}", inner.id, sender);
                return;
            }
            let outcome = inner.state.on_accepted(&sender, number, &value, inner.quorum);
            if let Some((number, value)) = outcome.proposer_decided {
                inner.resolver.mark(number, AttemptStatus::Succeeded);
                inner.resolver.reset_backoff();
                Inner::announce(inner, &value);
                let learn = PaxosMessage::new(
                    Kind::Learn,
                    inner.id.clone(),
                    number,
                    Some(value),
                );
                Inner::broadcast_simulated(inner, learn);
            } else if outcome.newly_learned {
                Inner::announce(inner, &value);
            }
        }
        | Kind::Learn => {
            let Some(value) = value else {
                warn!("{} LEARN from {} without a value", inner.id, sender);
                return;
            };
            if inner.state.force_learn(number, &value) {
                debug!("{} learned consensus directly from {}", inner.id, sender);
                Inner::announce(inner, &value);
            }
        }
        }
    }

    fn announce(inner: &Arc<Inner>, value: &str) {
        println!("CONSENSUS: {} has been elected Council President!", value);
        info!("{} learned consensus value: {}", inner.id, value);
    }

    /// Push one message through the network model, then the transport.
    /// The simulated latency is slept off in a task of its own so the
    /// dispatch loop never stalls.
    fn send_simulated(inner: &Arc<Inner>, target: MemberId, message: PaxosMessage) {
        let delivery = inner.sim.decide(&target, message.wire_size());
        if !delivery.delivered {
            debug!(
                "{} message {} to {} failed: {}",
                inner.id, message.kind, target, delivery.reason,
            );
            return;
        }

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            if !delivery.latency.is_zero() {
                tokio::time::sleep(delivery.latency).await;
            }
            if let Err(error) = inner.transport.send(&target, &message).await {
                debug!("{} failed to send to {}: {}", inner.id, target, error);
            }
        });
    }

    fn broadcast_simulated(inner: &Arc<Inner>, message: PaxosMessage) {
        let peers: Vec<MemberId> = inner.transport.peers().cloned().collect();
        for peer in peers {
            Inner::send_simulated(inner, peer, message.clone());
        }
    }

    /// Single 5-second budget for both phases of an attempt. A timeout
    /// fails the attempt and hands the retry to the backoff scheduler.
    fn arm_timeout(inner: &Arc<Inner>, number: ProposalNumber, value: String) {
        let task = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::time::sleep(PHASE_TIMEOUT).await;
                if inner.state.on_timeout(number) {
                    warn!("{} proposal {} timed out", inner.id, number);
                    inner.resolver.mark(number, AttemptStatus::Failed);
                    let delay = inner.resolver.backoff_delay();
                    Inner::schedule_retry(&inner, value, delay);
                }
            })
        };
        Inner::track(inner, task);
    }

    fn schedule_retry(inner: &Arc<Inner>, value: String, delay: Duration) {
        let task = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if !inner.running.load(Ordering::SeqCst) || inner.state.has_learned() {
                    return;
                }
                match Inner::propose(&inner, &value) {
                | Ok(number) => debug!("{} retrying `{}` as {}", inner.id, value, number),
                | Err(error) => debug!("{} retry skipped: {}", inner.id, error),
                }
            })
        };
        Inner::track(inner, task);
    }

    fn track(inner: &Arc<Inner>, task: JoinHandle<()>) {
        let mut tasks = inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Membership;

    fn membership() -> Membership {
        Membership::parse(
            "M1,127.0.0.1,9101\nM2,127.0.0.1,9102\nM3,127.0.0.1,9103\n",
        )
        .unwrap()
    }

    fn participant(ordinal: u32) -> Participant {
        Participant::new(
            MemberId::from_ordinal(ordinal),
            membership(),
            Profile::Reliable,
            Some(11),
        )
    }

    #[tokio::test]
    async fn rejects_invalid_values() {
        let member = participant(1);
        assert!(matches!(member.propose(""), Err(ProposeError::InvalidValue)));
        assert!(matches!(member.propose("a:b"), Err(ProposeError::InvalidValue)));
    }

    #[tokio::test]
    async fn rejects_double_proposals() {
        let member = participant(1);
        member.propose("M4").unwrap();
        assert!(matches!(member.propose("M5"), Err(ProposeError::InFlight)));
    }

    #[tokio::test]
    async fn rejects_proposals_after_decision() {
        let member = participant(1);
        member.inner.state.force_learn(ProposalNumber::new(1, 2), "M4");
        assert!(matches!(
            member.propose("M5"),
            Err(ProposeError::AlreadyDecided(value)) if value == "M4",
        ));
    }

    #[tokio::test]
    async fn proposal_numbers_increase_strictly() {
        let member = participant(1);
        let first = member.propose("M4").unwrap();
        member.inner.state.on_timeout(first);
        let second = member.propose("M4").unwrap();
        assert!(second > first);
        assert_eq!(second.ordinal, 1);
    }

    #[tokio::test]
    async fn prepare_triggers_promise_bookkeeping() {
        let member = participant(2);
        let number = ProposalNumber::new(3, 1);
        Inner::on_inbound(
            &member.inner,
            PaxosMessage::new(Kind::Prepare, MemberId::from_ordinal(1), number, None),
        );
        assert_eq!(member.inner.state.promised(), Some(number));
    }

    #[tokio::test]
    async fn learn_message_decides_immediately() {
        let member = participant(2);
        Inner::on_inbound(
            &member.inner,
            PaxosMessage::new(
                Kind::Learn,
                MemberId::from_ordinal(1),
                ProposalNumber::new(4, 1),
                Some("M7".to_owned()),
            ),
        );
        assert!(member.has_learned());
        assert_eq!(member.learned_value(), Some("M7".to_owned()));
    }

    #[tokio::test]
    async fn accepted_quorum_is_learned_without_proposing() {
        let member = participant(3);
        let number = ProposalNumber::new(2, 1);
        for sender in [1, 2] {
            Inner::on_inbound(
                &member.inner,
                PaxosMessage::new(
                    Kind::Accepted,
                    MemberId::from_ordinal(sender),
                    number,
                    Some("M8".to_owned()),
                ),
            );
        }
        assert_eq!(member.learned_value(), Some("M8".to_owned()));
    }

    #[tokio::test]
    async fn unknown_scenario_is_rejected() {
        let member = participant(1);
        assert!(!member.activate_scenario("bake_sale"));
    }
}
