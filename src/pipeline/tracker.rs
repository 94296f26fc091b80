use std::time::Duration;

use tokio::time::Instant;

/// Issues monotonically increasing request ids and recognises the latest one.
/// Any response carrying an older id is stale, however late it arrives.
#[derive(Debug, Default)]
pub struct RequestTracker {
    latest: u64,
}

impl RequestTracker {
    pub fn issue(&mut self) -> u64 {
        self.latest += 1;
        self.latest
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    pub fn is_current(&self, request_id: u64) -> bool {
        request_id == self.latest
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Throttled {
    BuildNow,
    Armed,
    AlreadyArmed,
}

/// Debounce for rebuild triggers: at most one pending deadline at a time.
#[derive(Debug)]
pub struct RebuildThrottle {
    delay: Option<Duration>,
    deadline: Option<Instant>,
}

impl RebuildThrottle {
    /// A zero delay disables throttling.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay: (!delay.is_zero()).then_some(delay),
            deadline: None,
        }
    }

    pub fn note_update(&mut self, now: Instant) -> Throttled {
        let Some(delay) = self.delay else {
            return Throttled::BuildNow;
        };
        if self.deadline.is_some() {
            return Throttled::AlreadyArmed;
        }
        self.deadline = Some(now + delay);
        Throttled::Armed
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarms after the deadline passed. Returns whether it was armed.
    pub fn fire(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}
