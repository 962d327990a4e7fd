//! # Summary
//!
//! This module loads the static membership file that names every peer in
//! the cluster. One entry per line, `peer_id,host,port[,profile]`, with
//! `#`-prefixed comments and blank lines ignored. Membership is fixed for
//! the life of the process; the loaded directory is treated as immutable.

use std::io::Write;
use std::path::Path;

use hashbrown::HashMap as Map;
use hashbrown::HashSet as Set;
use log::warn;

use crate::message::MemberId;
use crate::sim::Profile;

/// Fatal configuration problems. Startup aborts on any of these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read membership file: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {reason}")]
    BadLine { line: usize, reason: String },
    #[error("at least 3 members are required for consensus, found {0}")]
    TooFewMembers(usize),
    #[error("duplicate port {0}")]
    DuplicatePort(u16),
}

/// One membership entry.
#[derive(Clone, Debug)]
pub struct Member {
    pub id: MemberId,
    pub host: String,
    pub port: u16,
    pub profile: Profile,
}

/// The full, validated membership directory.
#[derive(Clone, Debug)]
pub struct Membership {
    members: Map<MemberId, Member>,
}

impl Membership {
    /// Load and validate a membership file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Membership::parse(&text)
    }

    /// Load a membership file, writing the default nine-member cluster
    /// first when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let mut file = std::fs::File::create(path)?;
            file.write_all(default_config().as_bytes())?;
        }
        Membership::load(path)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut members = Map::new();
        let mut ports = Set::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 || fields.len() > 4 {
                return Err(ConfigError::BadLine {
                    line: index + 1,
                    reason: format!("expected `id,host,port[,profile]`, found `{}`", line),
                });
            }

            let id: MemberId = fields[0].parse().map_err(|_| ConfigError::BadLine {
                line: index + 1,
                reason: format!("invalid member id `{}`", fields[0]),
            })?;
            let host = fields[1].to_owned();
            let port: u16 = fields[2].parse().map_err(|_| ConfigError::BadLine {
                line: index + 1,
                reason: format!("invalid port `{}`", fields[2]),
            })?;

            let profile = match fields.get(3) {
            | None => Profile::Standard,
            | Some(name) => name.parse().unwrap_or_else(|()| {
                warn!("unknown profile `{}` for {}, using STANDARD", name, id);
                Profile::Standard
            }),
            };

            if !ports.insert(port) {
                return Err(ConfigError::DuplicatePort(port));
            }

            members.insert(
                id.clone(),
                Member {
                    id,
                    host,
                    port,
                    profile,
                },
            );
        }

        if members.len() < 3 {
            return Err(ConfigError::TooFewMembers(members.len()));
        }

        Ok(Membership { members })
    }

    pub fn get(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &MemberId> {
        self.members.keys()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Smallest majority: any two quorums of this size intersect.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

fn default_config() -> String {
    let mut text = String::new();
    text.push_str("# Council membership\n");
    text.push_str("# Format: MemberID,Hostname,Port,Profile\n");
    text.push_str("# Profiles: RELIABLE, LATENT, FAILURE, STANDARD\n\n");

    let profiles = [
        "RELIABLE", "LATENT", "FAILURE", "STANDARD", "STANDARD",
        "STANDARD", "STANDARD", "STANDARD", "STANDARD",
    ];
    for (index, profile) in profiles.iter().enumerate() {
        let ordinal = index + 1;
        text.push_str(&format!("M{},localhost,{},{}\n", ordinal, 9000 + ordinal, profile));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_with_comments_and_blanks() {
        let membership = Membership::parse(
            "# cluster\n\
             M1,localhost,9001,RELIABLE\n\
             \n\
             M2,localhost,9002\n\
             M3,127.0.0.1,9003,latent\n",
        )
        .unwrap();

        assert_eq!(membership.len(), 3);
        assert_eq!(membership.majority(), 2);

        let m2 = membership.get(&MemberId::from_ordinal(2)).unwrap();
        assert_eq!(m2.profile, Profile::Standard);
        let m3 = membership.get(&MemberId::from_ordinal(3)).unwrap();
        assert_eq!(m3.profile, Profile::Latent);
        assert_eq!(m3.host, "127.0.0.1");
    }

    #[test]
    fn rejects_small_clusters() {
        let result = Membership::parse("M1,localhost,9001\nM2,localhost,9002\n");
        assert!(matches!(result, Err(ConfigError::TooFewMembers(2))));
    }

    #[test]
    fn rejects_duplicate_ports() {
        let result = Membership::parse(
            "M1,localhost,9001\nM2,localhost,9001\nM3,localhost,9003\n",
        );
        assert!(matches!(result, Err(ConfigError::DuplicatePort(9001))));
    }

    #[test]
    fn rejects_bad_member_ids() {
        let result = Membership::parse(
            "mayor,localhost,9001\nM2,localhost,9002\nM3,localhost,9003\n",
        );
        assert!(matches!(result, Err(ConfigError::BadLine { line: 1, .. })));
    }

    #[test]
    fn rejects_bad_ports() {
        let result = Membership::parse(
            "M1,localhost,nine\nM2,localhost,9002\nM3,localhost,9003\n",
        );
        assert!(matches!(result, Err(ConfigError::BadLine { line: 1, .. })));
    }

    #[test]
    fn unknown_profile_defaults_to_standard() {
        let membership = Membership::parse(
            "M1,localhost,9001,carrier-pigeon\nM2,localhost,9002\nM3,localhost,9003\n",
        )
        .unwrap();
        let m1 = membership.get(&MemberId::from_ordinal(1)).unwrap();
        assert_eq!(m1.profile, Profile::Standard);
    }

    #[test]
    fn default_config_is_valid() {
        let membership = Membership::parse(&default_config()).unwrap();
        assert_eq!(membership.len(), 9);
        assert_eq!(membership.majority(), 5);
        let m1 = membership.get(&MemberId::from_ordinal(1)).unwrap();
        assert_eq!(m1.profile, Profile::Reliable);
        assert_eq!(m1.port, 9001);
    }

    #[test]
    fn majorities_always_intersect() {
        for count in 3..=9 {
            let majority = count / 2 + 1;
            assert!(2 * majority > count);
        }
    }
}
