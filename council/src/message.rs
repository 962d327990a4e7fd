//! # Summary
//!
//! This module implements the wire codec for the five Paxos message kinds.
//!
//! Messages travel as single newline-terminated lines of colon-delimited
//! fields: `KIND:SENDER:NUMBER:VALUE[:PRIOR_NUMBER:PRIOR_VALUE]`. Empty
//! fields are encoded as the empty string between two delimiters, so a
//! PROMISE that carries a prior acceptance but no value looks like
//! `PROMISE:M3:7.3::5.1:X`. Anything that is not exactly four or six
//! fields is a framing error; the caller logs it and drops the line.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while decoding a wire line or validating its fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty message line")]
    Empty,
    #[error("expected 4 or 6 fields, found {0}")]
    FieldCount(usize),
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
    #[error("invalid member id `{0}`")]
    BadMember(String),
    #[error("invalid proposal number `{0}`")]
    BadNumber(String),
    #[error("value is empty or contains a reserved character")]
    BadValue,
}

/// Stable identity of a peer, of the form `M<k>` for a positive integer `k`.
///
/// The numeric suffix doubles as the ordinal used to break ties between
/// proposal numbers, which is what makes them unique cluster-wide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(String);

impl MemberId {
    pub fn from_ordinal(ordinal: u32) -> Self {
        MemberId(format!("M{}", ordinal))
    }

    /// Numeric suffix of the identifier.
    pub fn ordinal(&self) -> u32 {
        // Validated on construction
        self.0[1..].parse().unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MemberId {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ordinal = s
            .strip_prefix('M')
            .and_then(|rest| rest.parse::<u32>().ok())
            .filter(|ordinal| *ordinal > 0);
        match ordinal {
        | Some(_) => Ok(MemberId(s.to_owned())),
        | None => Err(FrameError::BadMember(s.to_owned())),
        }
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Totally-ordered proposal identifier: a per-peer counter broken by the
/// peer's ordinal. Ordering is lexicographic on `(counter, ordinal)`, which
/// the derived implementation provides through field order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProposalNumber {
    pub counter: u64,
    pub ordinal: u32,
}

impl ProposalNumber {
    pub fn new(counter: u64, ordinal: u32) -> Self {
        ProposalNumber { counter, ordinal }
    }
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.counter, self.ordinal)
    }
}

impl FromStr for ProposalNumber {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_once('.')
            .and_then(|(counter, ordinal)| {
                let counter = counter.parse().ok()?;
                let ordinal = ordinal.parse().ok()?;
                Some(ProposalNumber { counter, ordinal })
            })
            .ok_or_else(|| FrameError::BadNumber(s.to_owned()))
    }
}

/// Compare two proposal numbers in wire form.
///
/// Falls back to byte-wise comparison when either side does not parse as
/// `counter.ordinal`, so a defensive total order exists even for garbage.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (a.parse::<ProposalNumber>(), b.parse::<ProposalNumber>()) {
    | (Ok(a), Ok(b)) => a.cmp(&b),
    | _ => a.cmp(b),
    }
}

/// The five message kinds of single-decree Paxos.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Phase 1a: proposer asks acceptors to promise.
    Prepare,
    /// Phase 1b: acceptor promises, possibly carrying a prior acceptance.
    Promise,
    /// Phase 2a: proposer asks acceptors to accept a value.
    AcceptRequest,
    /// Phase 2b: acceptor confirms; doubles as the learner notification.
    Accepted,
    /// Post-decision broadcast of the chosen value.
    Learn,
}

impl Kind {
    fn as_wire(self) -> &'static str {
        match self {
        | Kind::Prepare => "PREPARE",
        | Kind::Promise => "PROMISE",
        | Kind::AcceptRequest => "ACCEPT_REQUEST",
        | Kind::Accepted => "ACCEPTED",
        | Kind::Learn => "LEARN",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
        | "PREPARE" => Some(Kind::Prepare),
        | "PROMISE" => Some(Kind::Promise),
        | "ACCEPT_REQUEST" => Some(Kind::AcceptRequest),
        | "ACCEPTED" => Some(Kind::Accepted),
        | "LEARN" => Some(Kind::Learn),
        | _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A single Paxos message.
///
/// PREPARE carries only a number; PROMISE answers a number and may attach
/// the acceptor's prior acceptance; ACCEPT_REQUEST, ACCEPTED, and LEARN all
/// carry a number and a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaxosMessage {
    pub kind: Kind,
    pub sender: MemberId,
    pub number: ProposalNumber,
    pub value: Option<String>,
    pub prior: Option<(ProposalNumber, String)>,
}

impl PaxosMessage {
    pub fn new(
        kind: Kind,
        sender: MemberId,
        number: ProposalNumber,
        value: Option<String>,
    ) -> Self {
        PaxosMessage {
            kind,
            sender,
            number,
            value,
            prior: None,
        }
    }

    /// PROMISE answering `number`, attaching a prior acceptance if any.
    pub fn promise(
        sender: MemberId,
        number: ProposalNumber,
        prior: Option<(ProposalNumber, String)>,
    ) -> Self {
        PaxosMessage {
            kind: Kind::Promise,
            sender,
            number,
            value: None,
            prior,
        }
    }

    pub fn serialize(&self) -> String {
        let mut line = format!(
            "{}:{}:{}:{}",
            self.kind,
            self.sender,
            self.number,
            self.value.as_deref().unwrap_or(""),
        );
        if let Some((number, value)) = &self.prior {
            line.push(':');
            line.push_str(&number.to_string());
            line.push(':');
            line.push_str(value);
        }
        line
    }

    pub fn deserialize(line: &str) -> Result<Self, FrameError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(FrameError::Empty);
        }

        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 && fields.len() != 6 {
            return Err(FrameError::FieldCount(fields.len()));
        }

        let kind = Kind::from_wire(fields[0])
            .ok_or_else(|| FrameError::UnknownKind(fields[0].to_owned()))?;
        let sender = fields[1].parse::<MemberId>()?;
        let number = fields[2].parse::<ProposalNumber>()?;
        let value = match fields[3] {
        | "" => None,
        | value => Some(value.to_owned()),
        };

        // A six-field line with either prior field empty decodes as no prior,
        // matching what serialize produces for a promise without one.
        let prior = if fields.len() == 6 && !fields[4].is_empty() && !fields[5].is_empty() {
            Some((fields[4].parse::<ProposalNumber>()?, fields[5].to_owned()))
        } else {
            None
        };

        Ok(PaxosMessage {
            kind,
            sender,
            number,
            value,
            prior,
        })
    }

    /// Rough wire footprint used by the network model's size-dependent delay.
    pub fn wire_size(&self) -> usize {
        self.serialize().len() + 50
    }
}

/// Proposed values ride inside the colon-delimited wire format, so they may
/// not contain the delimiter or a line break. Enforced here, once, on input.
pub fn validate_value(value: &str) -> Result<(), FrameError> {
    if value.is_empty() || value.contains([':', '\n', '\r']) {
        return Err(FrameError::BadValue);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(ordinal: u32) -> MemberId {
        MemberId::from_ordinal(ordinal)
    }

    fn n(counter: u64, ordinal: u32) -> ProposalNumber {
        ProposalNumber::new(counter, ordinal)
    }

    #[test]
    fn round_trip_prepare() {
        let message = PaxosMessage::new(Kind::Prepare, m(1), n(3, 1), None);
        assert_eq!(message.serialize(), "PREPARE:M1:3.1:");
        assert_eq!(PaxosMessage::deserialize(&message.serialize()).unwrap(), message);
    }

    #[test]
    fn round_trip_accept_request() {
        let message = PaxosMessage::new(
            Kind::AcceptRequest,
            m(8),
            n(12, 8),
            Some("M4".to_owned()),
        );
        assert_eq!(message.serialize(), "ACCEPT_REQUEST:M8:12.8:M4");
        assert_eq!(PaxosMessage::deserialize(&message.serialize()).unwrap(), message);
    }

    #[test]
    fn round_trip_promise_with_prior() {
        let message = PaxosMessage::promise(m(3), n(7, 3), Some((n(5, 1), "X".to_owned())));
        assert_eq!(message.serialize(), "PROMISE:M3:7.3::5.1:X");

        let decoded = PaxosMessage::deserialize("PROMISE:M3:7.3::5.1:X").unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.prior, Some((n(5, 1), "X".to_owned())));
    }

    #[test]
    fn round_trip_promise_without_prior() {
        let message = PaxosMessage::promise(m(2), n(4, 2), None);
        assert_eq!(message.serialize(), "PROMISE:M2:4.2:");
        assert_eq!(PaxosMessage::deserialize(&message.serialize()).unwrap(), message);
    }

    #[test]
    fn round_trip_learn() {
        let message = PaxosMessage::new(Kind::Learn, m(5), n(9, 5), Some("M7".to_owned()));
        assert_eq!(PaxosMessage::deserialize(&message.serialize()).unwrap(), message);
    }

    #[test]
    fn rejects_bad_field_counts() {
        assert_eq!(
            PaxosMessage::deserialize("PREPARE:M1:1.1"),
            Err(FrameError::FieldCount(3)),
        );
        assert_eq!(
            PaxosMessage::deserialize("PREPARE:M1:1.1:x:y"),
            Err(FrameError::FieldCount(5)),
        );
        assert_eq!(
            PaxosMessage::deserialize("PREPARE:M1:1.1:x:1.1:y:z"),
            Err(FrameError::FieldCount(7)),
        );
        assert_eq!(PaxosMessage::deserialize(""), Err(FrameError::Empty));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert_eq!(
            PaxosMessage::deserialize("GOSSIP:M1:1.1:x"),
            Err(FrameError::UnknownKind("GOSSIP".to_owned())),
        );
    }

    #[test]
    fn rejects_malformed_fields() {
        assert!(matches!(
            PaxosMessage::deserialize("PREPARE:nine:1.1:"),
            Err(FrameError::BadMember(_)),
        ));
        assert!(matches!(
            PaxosMessage::deserialize("PREPARE:M1:first:"),
            Err(FrameError::BadNumber(_)),
        ));
        assert!(matches!(
            PaxosMessage::deserialize("PREPARE:M1::"),
            Err(FrameError::BadNumber(_)),
        ));
    }

    #[test]
    fn compare_follows_counter_then_ordinal() {
        assert_eq!(compare("10.1", "9.9"), Ordering::Greater);
        assert_eq!(compare("3.2", "3.5"), Ordering::Less);
        assert_eq!(compare("3.2", "3.2"), Ordering::Equal);
    }

    #[test]
    fn compare_falls_back_to_bytes() {
        assert_eq!(compare("abc", "abd"), Ordering::Less);
        assert_eq!(compare("10.1", "10.x"), Ordering::Less);
    }

    #[test]
    fn ordering_is_total_and_consistent() {
        let numbers = [n(1, 1), n(1, 2), n(2, 1), n(9, 9), n(10, 1)];
        for a in &numbers {
            for b in &numbers {
                match a.cmp(b) {
                | Ordering::Less => assert_eq!(b.cmp(a), Ordering::Greater),
                | Ordering::Greater => assert_eq!(b.cmp(a), Ordering::Less),
                | Ordering::Equal => assert_eq!(a, b),
                }
                for c in &numbers {
                    if a.cmp(b) == Ordering::Less && b.cmp(c) == Ordering::Less {
                        assert_eq!(a.cmp(c), Ordering::Less);
                    }
                }
            }
        }
    }

    #[test]
    fn none_sorts_below_any_number() {
        assert!(None < Some(n(0, 1)));
        assert!(Some(n(0, 1)) < Some(n(0, 2)));
    }

    #[test]
    fn member_id_validation() {
        assert_eq!("M12".parse::<MemberId>().unwrap().ordinal(), 12);
        assert!("m1".parse::<MemberId>().is_err());
        assert!("M0".parse::<MemberId>().is_err());
        assert!("M".parse::<MemberId>().is_err());
        assert!("N1".parse::<MemberId>().is_err());
        assert!("M1x".parse::<MemberId>().is_err());
    }

    #[test]
    fn value_validation() {
        assert!(validate_value("M7").is_ok());
        assert!(validate_value("").is_err());
        assert!(validate_value("a:b").is_err());
        assert!(validate_value("a\nb").is_err());
    }
}
