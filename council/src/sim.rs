//! # Summary
//!
//! This module implements the network-behavior model: a wrapper around the
//! transport's send path that decides, per outbound message, whether to
//! drop it, delay it, or let it through.
//!
//! Behavior is driven by a [`Profile`] (latency, failure, and recovery
//! sub-models) modulated by the current [`Condition`]. Spontaneous
//! condition changes are drawn on a periodic tick for the flakier
//! profiles, and explicit partitions and offline windows can be injected
//! at runtime. Every decision lands in a bounded rolling event log, and
//! monotonic counters expose totals for the stats surface.

pub mod event;
pub mod profile;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet as Set;
use log::{debug, info};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::message::MemberId;
use crate::SharedRng;

pub use event::{EventKind, EventLog, NetworkEvent};
pub use profile::Profile;

const CONDITION_TICK: Duration = Duration::from_secs(10);
const EVENT_CLEANUP_TICK: Duration = Duration::from_secs(30);
const IMPROVEMENT_WINDOW: Duration = Duration::from_secs(10);
const IMPROVEMENT_RATE: f64 = 0.3;

/// Current mode of the simulated link, modulating delay and loss.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    Normal,
    Degraded,
    Partitioned,
    Offline,
    Recovering,
}

impl Condition {
    /// Multiplier applied to the profile's drop rate.
    fn drop_multiplier(self) -> f64 {
        match self {
        | Condition::Degraded => 3.0,
        | Condition::Partitioned => 5.0,
        | Condition::Recovering => 2.0,
        | _ => 1.0,
        }
    }

    /// Multiplier applied to the computed latency.
    fn latency_multiplier(self) -> f64 {
        match self {
        | Condition::Degraded => 2.0,
        | Condition::Partitioned => 5.0,
        | Condition::Recovering => 1.5,
        | _ => 1.0,
        }
    }

    /// Multiplier applied to the profile's connection-failure rate.
    fn failure_multiplier(self) -> f64 {
        match self {
        | Condition::Degraded => 2.0,
        | Condition::Recovering => 1.5,
        | _ => 1.0,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
        | Condition::Normal => f.write_str("NORMAL"),
        | Condition::Degraded => f.write_str("DEGRADED"),
        | Condition::Partitioned => f.write_str("PARTITIONED"),
        | Condition::Offline => f.write_str("OFFLINE"),
        | Condition::Recovering => f.write_str("RECOVERING"),
        }
    }
}

/// What the model decided to do with one outbound message.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub delivered: bool,
    pub latency: Duration,
    pub reason: &'static str,
}

impl Delivery {
    fn dropped(reason: &'static str) -> Self {
        Delivery {
            delivered: false,
            latency: Duration::ZERO,
            reason,
        }
    }
}

/// Snapshot of the simulator's counters for the stats surface.
#[derive(Clone, Debug)]
pub struct SimStats {
    pub profile: Profile,
    pub condition: Condition,
    pub messages_sent: u64,
    pub messages_lost: u64,
    pub loss_rate: f64,
    pub average_delay_ms: u64,
    pub partitioned_peers: usize,
    pub recent_events: usize,
}

impl fmt::Display for SimStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Profile: {}, Condition: {}", self.profile, self.condition)?;
        writeln!(f, "  Messages Sent: {}", self.messages_sent)?;
        writeln!(
            f,
            "  Messages Lost: {} ({:.1}%)",
            self.messages_lost,
            self.loss_rate * 100.0,
        )?;
        writeln!(f, "  Average Latency: {}ms", self.average_delay_ms)?;
        writeln!(f, "  Partitioned Peers: {}", self.partitioned_peers)?;
        write!(f, "  Recent Events: {}", self.recent_events)
    }
}

struct Link {
    profile: Profile,
    condition: Condition,
    partitioned: Set<MemberId>,
}

/// Per-peer network-behavior simulator.
pub struct NetworkSimulator {
    id: MemberId,
    link: Mutex<Link>,
    rng: SharedRng,
    sent: AtomicU64,
    lost: AtomicU64,
    delay_ms: AtomicU64,
    events: EventLog,
    active: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkSimulator {
    pub fn new(id: MemberId, profile: Profile, rng: SharedRng) -> Arc<Self> {
        info!("{} network simulator initialized with {} profile", id, profile);
        Arc::new(NetworkSimulator {
            id,
            link: Mutex::new(Link {
                profile,
                condition: Condition::Normal,
                partitioned: Set::new(),
            }),
            rng,
            sent: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            delay_ms: AtomicU64::new(0),
            events: EventLog::new(),
            active: AtomicBool::new(true),
            timers: Mutex::new(Vec::new()),
        })
    }

    /// Decide the fate of one outbound message. Decision order matters:
    /// inactive, partition, connection failure, drop, then latency.
    pub fn decide(self: &Arc<Self>, target: &MemberId, size: usize) -> Delivery {
        if !self.is_active() {
            return Delivery::dropped("inactive");
        }

        self.sent.fetch_add(1, Ordering::Relaxed);

        let (profile, condition, partitioned) = {
            let link = self.link.lock();
            (
                link.profile,
                link.condition,
                link.partitioned.contains(target),
            )
        };
        let models = profile.models();

        if partitioned {
            self.lost.fetch_add(1, Ordering::Relaxed);
            self.events.record(
                EventKind::MessageDropped,
                format!("message to {} dropped by partition", target),
            );
            return Delivery::dropped("partition");
        }

        if condition == Condition::Offline {
            self.lost.fetch_add(1, Ordering::Relaxed);
            self.events.record(
                EventKind::ConnectionFailed,
                format!("connection failed to {}", target),
            );
            return Delivery::dropped("connection failure");
        }

        let fail_rate = models.failure.conn_fail_rate * condition.failure_multiplier();
        if self.draw() < fail_rate {
            self.lost.fetch_add(1, Ordering::Relaxed);
            self.events.record(
                EventKind::ConnectionFailed,
                format!("connection failed to {}", target),
            );
            let down = models.failure.avg_down_ms + self.below(models.failure.avg_down_ms);
            self.go_offline(Duration::from_millis(down));
            return Delivery::dropped("connection failure");
        }

        let drop_rate = models.failure.drop_rate * condition.drop_multiplier();
        if self.draw() < drop_rate {
            self.lost.fetch_add(1, Ordering::Relaxed);
            self.events.record(
                EventKind::MessageDropped,
                format!("message to {} dropped", target),
            );
            return Delivery::dropped("message dropped");
        }

        let latency = self.latency(&models.latency, condition, size);
        self.delay_ms.fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        if latency.is_zero() {
            self.events.record(
                EventKind::MessageSent,
                format!("message sent to {}", target),
            );
        } else {
            self.events.record(
                EventKind::MessageDelayed,
                format!("message to {} delayed by {}ms", target, latency.as_millis()),
            );
        }

        Delivery {
            delivered: true,
            latency,
            reason: "delivered",
        }
    }

    /// `latency = max(0, (base + jitter + size/100) * condition_mult)`,
    /// where a spike draw first replaces `base` with `U[base, max)`.
    fn latency(
        self: &Arc<Self>,
        model: &profile::LatencyModel,
        condition: Condition,
        size: usize,
    ) -> Duration {
        let mut base = model.base_ms as f64;
        if self.draw() < model.spike_rate && model.max_ms > model.base_ms {
            base += self.draw() * (model.max_ms - model.base_ms) as f64;
        }

        let jitter = if model.jitter_ms > 0 {
            let jitter_ms = model.jitter_ms as i64;
            self.rng.lock().gen_range(-jitter_ms..=jitter_ms) as f64
        } else {
            0.0
        };

        let size_ms = (size / 100) as f64;
        let total = (base + jitter + size_ms) * condition.latency_multiplier();
        Duration::from_millis(total.max(0.0) as u64)
    }

    /// Switch profiles immediately. Entering LATENT occasionally pins the
    /// condition to NORMAL for a short window before restoring it.
    pub fn set_profile(self: &Arc<Self>, profile: Profile) {
        let previous = {
            let mut link = self.link.lock();
            std::mem::replace(&mut link.profile, profile)
        };
        self.events.record(
            EventKind::ConditionChanged,
            format!("profile changed from {} to {}", previous, profile),
        );
        info!("{} network profile changed to {}", self.id, profile);

        if profile == Profile::Latent && self.draw() < IMPROVEMENT_RATE {
            let prior = {
                let mut link = self.link.lock();
                std::mem::replace(&mut link.condition, Condition::Normal)
            };
            self.events.record(
                EventKind::ConditionChanged,
                format!("temporary improvement for {}ms", IMPROVEMENT_WINDOW.as_millis()),
            );
            let sim = Arc::clone(self);
            self.track(tokio::spawn(async move {
                tokio::time::sleep(IMPROVEMENT_WINDOW).await;
                if !sim.is_active() {
                    return;
                }
                sim.link.lock().condition = prior;
                sim.events.record(
                    EventKind::ConditionChanged,
                    format!("improvement ended, back to {}", prior),
                );
            }));
        }
    }

    /// Cut the link to the given peers for `duration`.
    pub fn simulate_partition(self: &Arc<Self>, peers: Vec<MemberId>, duration: Duration) {
        {
            let mut link = self.link.lock();
            link.partitioned.extend(peers.iter().cloned());
            if link.condition == Condition::Normal {
                link.condition = Condition::Partitioned;
            }
        }
        self.events.record(
            EventKind::PartitionStarted,
            format!("partitioned from {} peers", peers.len()),
        );
        info!("{} partitioned from {:?}", self.id, peers);

        let sim = Arc::clone(self);
        self.track(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if !sim.is_active() {
                return;
            }
            {
                let mut link = sim.link.lock();
                for peer in &peers {
                    link.partitioned.remove(peer);
                }
                if link.partitioned.is_empty() && link.condition == Condition::Partitioned {
                    link.condition = Condition::Normal;
                }
            }
            sim.events.record(
                EventKind::PartitionEnded,
                format!("partition ended with {} peers", peers.len()),
            );
            info!("{} partition recovered", sim.id);
        }));
    }

    /// Go completely offline for `duration`, then run the recovery path.
    pub fn simulate_offline(self: &Arc<Self>, duration: Duration) {
        self.events.record(
            EventKind::ConditionChanged,
            format!("going offline for {}ms", duration.as_millis()),
        );
        info!("{} going offline for {}ms", self.id, duration.as_millis());
        self.go_offline(duration);
    }

    /// Transition to OFFLINE and schedule the recovery chain: RECOVERING
    /// after the downtime, then a stability draw deciding between NORMAL
    /// and a DEGRADED interlude that a second tick resolves to NORMAL.
    fn go_offline(self: &Arc<Self>, duration: Duration) {
        self.link.lock().condition = Condition::Offline;

        let sim = Arc::clone(self);
        self.track(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if !sim.is_active() {
                return;
            }

            sim.link.lock().condition = Condition::Recovering;
            sim.events.record(
                EventKind::ConnectionRecovered,
                "coming back online".to_owned(),
            );

            let recovery = { sim.link.lock().profile }.models().recovery;
            tokio::time::sleep(Duration::from_millis(recovery.recovery_ms)).await;
            if !sim.is_active() {
                return;
            }

            if sim.draw() < recovery.stability {
                sim.link.lock().condition = Condition::Normal;
                sim.events.record(
                    EventKind::ConnectionRecovered,
                    "connection restored".to_owned(),
                );
            } else {
                sim.link.lock().condition = Condition::Degraded;
                sim.events.record(
                    EventKind::ConnectionRecovered,
                    "connection restored (degraded)".to_owned(),
                );
                tokio::time::sleep(Duration::from_millis(recovery.recovery_ms)).await;
                if !sim.is_active() {
                    return;
                }
                let mut link = sim.link.lock();
                if link.condition == Condition::Degraded {
                    link.condition = Condition::Normal;
                    drop(link);
                    sim.events.record(
                        EventKind::ConditionChanged,
                        "fully recovered".to_owned(),
                    );
                }
            }
        }));
    }

    /// Start the periodic condition and cleanup tasks.
    pub fn spawn_timers(self: &Arc<Self>) {
        let sim = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let mut tick = tokio::time::interval(CONDITION_TICK);
            tick.tick().await;
            loop {
                tick.tick().await;
                if !sim.is_active() {
                    break;
                }
                sim.spontaneous_change();
            }
        }));

        let sim = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVENT_CLEANUP_TICK);
            tick.tick().await;
            loop {
                tick.tick().await;
                if !sim.is_active() {
                    break;
                }
                sim.events.prune();
            }
        }));
    }

    /// Profile-specific spontaneous misbehavior, drawn once per tick.
    fn spontaneous_change(self: &Arc<Self>) {
        let profile = self.link.lock().profile;
        match profile {
        | Profile::Failure if self.draw() < 0.1 => {
            let down = 3000 + self.below(5000);
            self.simulate_offline(Duration::from_millis(down));
        }
        | Profile::Latent if self.draw() < 0.15 => {
            let prior = {
                let mut link = self.link.lock();
                std::mem::replace(&mut link.condition, Condition::Degraded)
            };
            self.events.record(
                EventKind::ConditionChanged,
                format!("link degraded, was {}", prior),
            );
            let hold = 2000 + self.below(3000);
            let sim = Arc::clone(self);
            self.track(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(hold)).await;
                if !sim.is_active() {
                    return;
                }
                let mut link = sim.link.lock();
                if link.condition == Condition::Degraded {
                    link.condition = prior;
                }
            }));
        }
        | _ => (),
        }
    }

    /// Deactivate the simulator and cancel all scheduled transitions.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        for task in self.timers.lock().drain(..) {
            task.abort();
        }
        debug!("{} network simulator shut down", self.id);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn profile(&self) -> Profile {
        self.link.lock().profile
    }

    pub fn condition(&self) -> Condition {
        self.link.lock().condition
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn messages_lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn loss_rate(&self) -> f64 {
        let sent = self.messages_sent();
        if sent == 0 {
            0.0
        } else {
            self.messages_lost() as f64 / sent as f64
        }
    }

    pub fn recent_events(&self, count: usize) -> Vec<NetworkEvent> {
        self.events.recent(count)
    }

    pub fn stats(&self) -> SimStats {
        let link = self.link.lock();
        let sent = self.messages_sent();
        SimStats {
            profile: link.profile,
            condition: link.condition,
            messages_sent: sent,
            messages_lost: self.messages_lost(),
            loss_rate: self.loss_rate(),
            average_delay_ms: if sent == 0 {
                0
            } else {
                self.delay_ms.load(Ordering::Relaxed) / sent
            },
            partitioned_peers: link.partitioned.len(),
            recent_events: self.events.len(),
        }
    }

    fn draw(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }

    fn below(&self, bound: u64) -> u64 {
        if bound == 0 {
            0
        } else {
            self.rng.lock().gen_range(0..bound)
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut timers = self.timers.lock();
        timers.retain(|task| !task.is_finished());
        timers.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn simulator(profile: Profile) -> Arc<NetworkSimulator> {
        let rng: SharedRng = Arc::new(Mutex::new(StdRng::seed_from_u64(42)));
        NetworkSimulator::new(MemberId::from_ordinal(1), profile, rng)
    }

    fn peer(ordinal: u32) -> MemberId {
        MemberId::from_ordinal(ordinal)
    }

    #[tokio::test]
    async fn reliable_profile_never_drops() {
        let sim = simulator(Profile::Reliable);
        for _ in 0..500 {
            let delivery = sim.decide(&peer(2), 40);
            assert!(delivery.delivered);
            assert!(delivery.latency <= Duration::from_millis(12));
        }
        assert_eq!(sim.messages_lost(), 0);
        assert_eq!(sim.messages_sent(), 500);
        assert_eq!(sim.loss_rate(), 0.0);
    }

    #[tokio::test]
    async fn partitioned_peer_always_drops() {
        let sim = simulator(Profile::Reliable);
        sim.simulate_partition(vec![peer(2)], Duration::from_secs(60));

        let delivery = sim.decide(&peer(2), 40);
        assert!(!delivery.delivered);
        assert_eq!(delivery.reason, "partition");
        assert_eq!(sim.condition(), Condition::Partitioned);

        // Peers outside the partition set still get through.
        let delivery = sim.decide(&peer(3), 40);
        assert!(delivery.delivered);
    }

    #[tokio::test]
    async fn offline_condition_drops_everything() {
        let sim = simulator(Profile::Reliable);
        sim.simulate_offline(Duration::from_secs(60));
        assert_eq!(sim.condition(), Condition::Offline);

        let delivery = sim.decide(&peer(2), 40);
        assert!(!delivery.delivered);
        assert_eq!(delivery.reason, "connection failure");
    }

    #[tokio::test]
    async fn inactive_simulator_drops_without_counting() {
        let sim = simulator(Profile::Reliable);
        sim.shutdown();

        let delivery = sim.decide(&peer(2), 40);
        assert!(!delivery.delivered);
        assert_eq!(delivery.reason, "inactive");
        assert_eq!(sim.messages_sent(), 0);
    }

    #[tokio::test]
    async fn failure_profile_loses_messages() {
        let sim = simulator(Profile::Failure);
        for _ in 0..300 {
            sim.decide(&peer(2), 40);
        }
        // drop_rate 0.35 plus connection failures: some loss is certain.
        assert!(sim.messages_lost() > 0);
        assert!(sim.loss_rate() > 0.0);
    }

    #[tokio::test]
    async fn decisions_are_recorded_as_events() {
        let sim = simulator(Profile::Reliable);
        sim.decide(&peer(2), 40);
        assert!(!sim.recent_events(10).is_empty());
    }

    #[tokio::test]
    async fn stats_reflect_profile_and_condition() {
        let sim = simulator(Profile::Standard);
        let stats = sim.stats();
        assert_eq!(stats.profile, Profile::Standard);
        assert_eq!(stats.condition, Condition::Normal);
        assert_eq!(stats.messages_sent, 0);
    }
}
