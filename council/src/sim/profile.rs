//! Named network profiles and their parameter bundles.

use std::fmt;
use std::str::FromStr;

/// Latency characteristics of a profile, in milliseconds.
#[derive(Copy, Clone, Debug)]
pub struct LatencyModel {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
    /// Probability that a send replaces its base latency with a spike drawn
    /// uniformly from `[base, max)`.
    pub spike_rate: f64,
}

/// Failure characteristics of a profile.
#[derive(Copy, Clone, Debug)]
pub struct FailureModel {
    pub drop_rate: f64,
    pub conn_fail_rate: f64,
    pub avg_down_ms: u64,
}

/// Recovery characteristics of a profile.
#[derive(Copy, Clone, Debug)]
pub struct RecoveryModel {
    pub recovery_ms: u64,
    /// Probability that a peer comes back NORMAL rather than DEGRADED.
    pub stability: f64,
}

/// The three sub-models that parameterize one profile.
#[derive(Copy, Clone, Debug)]
pub struct ProfileModels {
    pub latency: LatencyModel,
    pub failure: FailureModel,
    pub recovery: RecoveryModel,
}

pub static RELIABLE: ProfileModels = ProfileModels {
    latency: LatencyModel { base_ms: 0, max_ms: 10, jitter_ms: 2, spike_rate: 0.0 },
    failure: FailureModel { drop_rate: 0.0, conn_fail_rate: 0.0, avg_down_ms: 0 },
    recovery: RecoveryModel { recovery_ms: 100, stability: 0.99 },
};

pub static LATENT: ProfileModels = ProfileModels {
    latency: LatencyModel { base_ms: 800, max_ms: 4000, jitter_ms: 1200, spike_rate: 0.3 },
    failure: FailureModel { drop_rate: 0.15, conn_fail_rate: 0.05, avg_down_ms: 3000 },
    recovery: RecoveryModel { recovery_ms: 2000, stability: 0.6 },
};

pub static FAILURE: ProfileModels = ProfileModels {
    latency: LatencyModel { base_ms: 100, max_ms: 1500, jitter_ms: 400, spike_rate: 0.2 },
    failure: FailureModel { drop_rate: 0.35, conn_fail_rate: 0.15, avg_down_ms: 5000 },
    recovery: RecoveryModel { recovery_ms: 1500, stability: 0.4 },
};

pub static STANDARD: ProfileModels = ProfileModels {
    latency: LatencyModel { base_ms: 30, max_ms: 200, jitter_ms: 80, spike_rate: 0.1 },
    failure: FailureModel { drop_rate: 0.05, conn_fail_rate: 0.01, avg_down_ms: 1000 },
    recovery: RecoveryModel { recovery_ms: 500, stability: 0.85 },
};

/// A named bundle of latency, failure, and recovery behavior, chosen per
/// peer at startup and changeable at runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Profile {
    Reliable,
    Latent,
    Failure,
    Standard,
}

impl Profile {
    pub fn models(self) -> &'static ProfileModels {
        match self {
        | Profile::Reliable => &RELIABLE,
        | Profile::Latent => &LATENT,
        | Profile::Failure => &FAILURE,
        | Profile::Standard => &STANDARD,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
        | Profile::Reliable => f.write_str("RELIABLE"),
        | Profile::Latent => f.write_str("LATENT"),
        | Profile::Failure => f.write_str("FAILURE"),
        | Profile::Standard => f.write_str("STANDARD"),
        }
    }
}

impl FromStr for Profile {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
        | "RELIABLE" => Ok(Profile::Reliable),
        | "LATENT" => Ok(Profile::Latent),
        | "FAILURE" => Ok(Profile::Failure),
        | "STANDARD" => Ok(Profile::Standard),
        | _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("reliable".parse::<Profile>().unwrap(), Profile::Reliable);
        assert_eq!("Latent".parse::<Profile>().unwrap(), Profile::Latent);
        assert_eq!("FAILURE".parse::<Profile>().unwrap(), Profile::Failure);
        assert!("cafe".parse::<Profile>().is_err());
    }

    #[test]
    fn reliable_never_fails() {
        let models = Profile::Reliable.models();
        assert_eq!(models.failure.drop_rate, 0.0);
        assert_eq!(models.failure.conn_fail_rate, 0.0);
        assert_eq!(models.latency.base_ms, 0);
    }
}
