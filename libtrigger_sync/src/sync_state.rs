use std::time::{Duration, Instant};

use super::messages::PulseLengths;

/// What the client last pushed to the server, as far as we can still vouch for it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    Unknown,
    Pulse,
    Noise,
    Continuous,
}

/// SyncTracker decides whether the server's trigger state is still the one this client
/// last sent.
///
/// Any TRIGGER message later than `grace` after our own push means someone else changed
/// the configuration. A STATUS message with different record lengths does too.
#[derive(Debug, Clone)]
pub struct SyncTracker {
    state: SyncState,
    grace: Duration,
    last_sent: Option<Instant>,
    lengths: Option<PulseLengths>,
}

impl SyncTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            state: SyncState::Unknown,
            grace,
            last_sent: None,
            lengths: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn mark_sent(&mut self, state: SyncState, now: Instant) {
        self.state = state;
        self.last_sent = Some(now);
    }

    pub fn mark_lengths(&mut self, lengths: PulseLengths) {
        self.lengths = Some(lengths);
    }

    pub fn invalidate(&mut self) {
        self.state = SyncState::Unknown;
    }

    pub fn on_trigger_message(&mut self, now: Instant) {
        if let Some(sent) = self.last_sent {
            if now.saturating_duration_since(sent) > self.grace {
                self.state = SyncState::Unknown;
            }
        }
    }

    pub fn on_status_lengths(&mut self, lengths: PulseLengths) {
        if let Some(expected) = self.lengths {
            if expected != lengths {
                self.state = SyncState::Unknown;
            }
        }
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_within_grace_keeps_sync() {
        let t0 = Instant::now();
        let mut tracker = SyncTracker::new(Duration::from_millis(1500));
        tracker.mark_sent(SyncState::Pulse, t0);
        tracker.on_trigger_message(t0 + Duration::from_millis(100));
        assert_eq!(tracker.state(), SyncState::Pulse);
        tracker.on_trigger_message(t0 + Duration::from_secs(2));
        assert_eq!(tracker.state(), SyncState::Unknown);
    }

    #[test]
    fn test_length_change_breaks_sync() {
        let mut tracker = SyncTracker::new(Duration::from_millis(100));
        let lengths = PulseLengths {
            nsamp: 1024,
            npre: 256,
        };
        tracker.mark_lengths(lengths);
        tracker.mark_sent(SyncState::Noise, Instant::now());
        tracker.on_status_lengths(lengths);
        assert_eq!(tracker.state(), SyncState::Noise);
        tracker.on_status_lengths(PulseLengths {
            nsamp: 2048,
            npre: 256,
        });
        assert_eq!(tracker.state(), SyncState::Unknown);
    }
}
