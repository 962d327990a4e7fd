//! # Summary
//!
//! This crate implements a fault-tolerant single-decree consensus
//! participant for the council presidential election, using the Paxos
//! protocol over an asynchronous, lossy message-passing network.
//!
//! A fixed membership of N peers (N >= 3) cooperatively elects one value
//! from among those any peer proposes; every non-faulty peer eventually
//! learns the same value. Each peer plays all three Paxos roles at once:
//!
//! - **Proposer**: drives phase 1 (PREPARE/PROMISE) and phase 2
//!   (ACCEPT_REQUEST/ACCEPTED), retrying with backoff when duelling
//!   proposers collide.
//! - **Acceptor**: upholds the promise and acceptance invariants under a
//!   single instance lock.
//! - **Learner**: counts acceptances per proposal number and fixes the
//!   decision as soon as any number reaches a majority.
//!
//! # Usage
//!
//! Load a [`Membership`] directory, build a [`Participant`], start it on
//! its port, and call [`Participant::propose`]:
//!
//! ```ignore
//! let membership = Membership::load(Path::new("network.config"))?;
//! let member = Participant::new("M3".parse()?, membership, Profile::Standard, None);
//! member.start(9003).await?;
//! member.propose("M7")?;
//! ```
//!
//! # Network simulation
//!
//! Every outbound message passes through a per-peer [`sim::NetworkSimulator`]
//! that injects latency, loss, partitions, and offline windows according
//! to a [`Profile`], so the protocol can be exercised end-to-end under
//! adversarial conditions without leaving the local machine.

mod constants;
pub mod config;
pub mod internal;
pub mod message;
pub mod participant;
pub mod resolver;
pub mod scenario;
pub mod sim;
pub mod socket;
pub mod state;

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;

/// The per-peer random source. Every stochastic decision a peer makes
/// (profile draws, jitter, backoff, conflict-aware counter jumps) comes
/// from this one seedable generator, so runs can be made deterministic.
pub type SharedRng = Arc<Mutex<StdRng>>;

pub use crate::config::{ConfigError, Membership};
pub use crate::message::{FrameError, Kind, MemberId, PaxosMessage, ProposalNumber};
pub use crate::participant::{Participant, ProposeError};
pub use crate::scenario::Scenario;
pub use crate::sim::{Condition, NetworkSimulator, Profile};
pub use crate::state::Phase;
