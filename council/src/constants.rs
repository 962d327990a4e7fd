//! Protocol-wide tuning constants.

use std::time::Duration;

/// Ports default to `BASE_PORT + member ordinal` (M3 listens on 9003).
pub const BASE_PORT: u16 = 9000;

/// Combined budget for phase 1 and phase 2 of a single proposal attempt.
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Starting point for the exponential backoff between proposal attempts.
pub const MIN_BACKOFF_MS: u64 = 100;

/// Ceiling for the exponential backoff between proposal attempts.
pub const MAX_BACKOFF_MS: u64 = 5000;

/// Growth factor applied to the backoff after each delay is handed out.
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Sliding window over which proposal attempts count as concurrent activity.
pub const CONFLICT_WINDOW: Duration = Duration::from_secs(10);

/// Two attempts started within this interval of each other are duelling.
pub const CONCURRENCY_WINDOW: Duration = Duration::from_secs(2);

/// Upper bound on archived instances kept for inspection.
pub const MAX_HISTORY: usize = 100;

/// A decided participant re-announces the decision at this interval so that
/// peers that were unreachable at decision time still converge.
pub const LEARN_REBROADCAST: Duration = Duration::from_secs(5);
