//! Rolling log of network-behavior decisions.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MAX_EVENTS: usize = 100;
const MAX_EVENT_AGE: Duration = Duration::from_secs(60);

/// What happened to a send, or to the connection as a whole.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    MessageSent,
    MessageDelayed,
    MessageDropped,
    ConnectionFailed,
    ConnectionRecovered,
    PartitionStarted,
    PartitionEnded,
    ConditionChanged,
}

/// One entry in the rolling event log. Timestamps are milliseconds on the
/// simulator's own monotonic clock, never wall-clock time.
#[derive(Clone, Debug)]
pub struct NetworkEvent {
    pub at: Duration,
    pub kind: EventKind,
    pub description: String,
}

impl fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>8}ms] {:?}: {}",
            self.at.as_millis(),
            self.kind,
            self.description,
        )
    }
}

/// Ring buffer of recent events, bounded both by entry count and by age.
pub struct EventLog {
    epoch: Instant,
    entries: Mutex<VecDeque<(Instant, NetworkEvent)>>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog {
            epoch: Instant::now(),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, kind: EventKind, description: String) {
        let now = Instant::now();
        let event = NetworkEvent {
            at: now.duration_since(self.epoch),
            kind,
            description,
        };
        let mut entries = self.entries.lock();
        entries.push_back((now, event));
        while entries.len() > MAX_EVENTS {
            entries.pop_front();
        }
    }

    /// Most recent `count` events, newest first.
    pub fn recent(&self, count: usize) -> Vec<NetworkEvent> {
        self.entries
            .lock()
            .iter()
            .rev()
            .take(count)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Drop entries older than the retention window.
    pub fn prune(&self) {
        let Some(cutoff) = Instant::now().checked_sub(MAX_EVENT_AGE) else {
            return;
        };
        let mut entries = self.entries.lock();
        while entries.front().is_some_and(|(at, _)| *at < cutoff) {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_max_entries() {
        let log = EventLog::new();
        for i in 0..150 {
            log.record(EventKind::MessageSent, format!("message {}", i));
        }
        assert_eq!(log.len(), MAX_EVENTS);

        let recent = log.recent(2);
        assert_eq!(recent[0].description, "message 149");
        assert_eq!(recent[1].description, "message 148");
    }

    #[test]
    fn recent_returns_newest_first() {
        let log = EventLog::new();
        log.record(EventKind::MessageSent, "first".to_owned());
        log.record(EventKind::MessageDropped, "second".to_owned());

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, EventKind::MessageDropped);
        assert_eq!(recent[1].kind, EventKind::MessageSent);
    }

    #[test]
    fn prune_keeps_fresh_entries() {
        let log = EventLog::new();
        log.record(EventKind::ConditionChanged, "fresh".to_owned());
        log.prune();
        assert_eq!(log.len(), 1);
    }
}
