//! # Summary
//!
//! Predefined network scenarios: bundles of profile overrides and delayed
//! network actions used to push the cluster into interesting shapes.
//!
//! A scenario names every affected member; each peer applies only the
//! parts that target itself, so activating the same scenario on every
//! process yields the cluster-wide picture.

use std::time::Duration;

use crate::message::MemberId;
use crate::sim::Profile;

/// One delayed action against a single member's network link.
#[derive(Clone, Debug)]
pub enum ActionKind {
    ChangeProfile(Profile),
    Partition {
        peers: Vec<MemberId>,
        duration: Duration,
    },
    Offline(Duration),
    /// Extended, randomized offline window standing in for a crash.
    Crash,
}

#[derive(Clone, Debug)]
pub struct Action {
    pub delay: Duration,
    pub target: MemberId,
    pub kind: ActionKind,
}

/// A named scenario: initial profile overrides plus scheduled actions,
/// reverting to configured profiles when the duration elapses.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub duration: Duration,
    pub profiles: Vec<(MemberId, Profile)>,
    pub actions: Vec<Action>,
}

fn m(ordinal: u32) -> MemberId {
    MemberId::from_ordinal(ordinal)
}

fn all_members(profile: Profile) -> Vec<(MemberId, Profile)> {
    (1..=9).map(|ordinal| (m(ordinal), profile)).collect()
}

impl Scenario {
    /// Look up one of the predefined scenarios by its CLI name.
    pub fn by_name(name: &str) -> Option<Scenario> {
        match name.to_ascii_lowercase().as_str() {
        | "ideal" => Some(Scenario::ideal()),
        | "high_latency" => Some(Scenario::high_latency()),
        | "network_partition" => Some(Scenario::network_partition()),
        | "member_failures" => Some(Scenario::member_failures()),
        | "recovery_test" => Some(Scenario::recovery_test()),
        | "stress_test" => Some(Scenario::stress_test()),
        | _ => None,
        }
    }

    pub fn names() -> &'static [&'static str] {
        &[
            "ideal",
            "high_latency",
            "network_partition",
            "member_failures",
            "recovery_test",
            "stress_test",
        ]
    }

    fn ideal() -> Scenario {
        Scenario {
            name: "Ideal Network",
            description: "All members have reliable connections",
            duration: Duration::from_secs(30),
            profiles: all_members(Profile::Reliable),
            actions: Vec::new(),
        }
    }

    fn high_latency() -> Scenario {
        Scenario {
            name: "High Latency",
            description: "All members experience high latency",
            duration: Duration::from_secs(45),
            profiles: all_members(Profile::Latent),
            actions: Vec::new(),
        }
    }

    fn network_partition() -> Scenario {
        let low = vec![m(1), m(2), m(3), m(4)];
        let high = vec![m(5), m(6), m(7), m(8), m(9)];
        let duration = Duration::from_secs(30);

        let mut actions = Vec::new();
        for member in &low {
            actions.push(Action {
                delay: Duration::from_secs(1),
                target: member.clone(),
                kind: ActionKind::Partition {
                    peers: high.clone(),
                    duration,
                },
            });
        }
        for member in &high {
            actions.push(Action {
                delay: Duration::from_secs(1),
                target: member.clone(),
                kind: ActionKind::Partition {
                    peers: low.clone(),
                    duration,
                },
            });
        }

        Scenario {
            name: "Network Partition",
            description: "Members split into two partitions",
            duration: Duration::from_secs(60),
            profiles: Vec::new(),
            actions,
        }
    }

    fn member_failures() -> Scenario {
        Scenario {
            name: "Member Failures",
            description: "Random member failures and recoveries",
            duration: Duration::from_secs(90),
            profiles: vec![(m(3), Profile::Failure), (m(7), Profile::Failure)],
            actions: vec![
                Action {
                    delay: Duration::from_secs(5),
                    target: m(3),
                    kind: ActionKind::Crash,
                },
                Action {
                    delay: Duration::from_secs(15),
                    target: m(7),
                    kind: ActionKind::Offline(Duration::from_secs(10)),
                },
                Action {
                    delay: Duration::from_secs(30),
                    target: m(2),
                    kind: ActionKind::Offline(Duration::from_secs(8)),
                },
            ],
        }
    }

    fn recovery_test() -> Scenario {
        Scenario {
            name: "Recovery Test",
            description: "Test recovery from various failure conditions",
            duration: Duration::from_secs(120),
            profiles: vec![
                (m(1), Profile::Failure),
                (m(3), Profile::Failure),
                (m(5), Profile::Latent),
            ],
            actions: vec![
                Action {
                    delay: Duration::from_secs(10),
                    target: m(1),
                    kind: ActionKind::ChangeProfile(Profile::Standard),
                },
                Action {
                    delay: Duration::from_secs(20),
                    target: m(3),
                    kind: ActionKind::ChangeProfile(Profile::Reliable),
                },
                Action {
                    delay: Duration::from_secs(30),
                    target: m(5),
                    kind: ActionKind::ChangeProfile(Profile::Standard),
                },
            ],
        }
    }

    fn stress_test() -> Scenario {
        Scenario {
            name: "Stress Test",
            description: "High-stress conditions with multiple failures",
            duration: Duration::from_secs(180),
            profiles: Vec::new(),
            actions: vec![
                Action {
                    delay: Duration::from_secs(5),
                    target: m(2),
                    kind: ActionKind::ChangeProfile(Profile::Latent),
                },
                Action {
                    delay: Duration::from_secs(10),
                    target: m(3),
                    kind: ActionKind::ChangeProfile(Profile::Failure),
                },
                Action {
                    delay: Duration::from_secs(20),
                    target: m(7),
                    kind: ActionKind::Crash,
                },
                Action {
                    delay: Duration::from_secs(30),
                    target: m(9),
                    kind: ActionKind::Offline(Duration::from_secs(15)),
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_named_scenarios_resolve() {
        for name in Scenario::names() {
            assert!(Scenario::by_name(name).is_some(), "missing scenario {}", name);
        }
        assert!(Scenario::by_name("IDEAL").is_some());
        assert!(Scenario::by_name("bake_sale").is_none());
    }

    #[test]
    fn partition_scenario_splits_cluster_both_ways() {
        let scenario = Scenario::by_name("network_partition").unwrap();
        assert_eq!(scenario.actions.len(), 9);

        let m1_action = scenario
            .actions
            .iter()
            .find(|action| action.target == m(1))
            .unwrap();
        match &m1_action.kind {
        | ActionKind::Partition { peers, .. } => assert_eq!(peers.len(), 5),
        | kind => panic!("expected partition, got {:?}", kind),
        }
    }

    #[test]
    fn ideal_scenario_covers_all_members() {
        let scenario = Scenario::by_name("ideal").unwrap();
        assert_eq!(scenario.profiles.len(), 9);
        assert!(scenario
            .profiles
            .iter()
            .all(|(_, profile)| *profile == Profile::Reliable));
    }
}
