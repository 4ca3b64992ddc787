use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::millis;
use crate::session::PeerId;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Bounded exponential backoff for Data sessions that lost their transport.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(with = "millis")]
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (zero-based): `base * factor^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Armed { attempt: u32, delay: Duration },
    AlreadyArmed,
    Exhausted { attempts: u32 },
}

/// Retry timer owned by a session actor. The actor polls [`deadline`] in its
/// select loop and calls [`fire`] when it elapses.
///
/// [`deadline`]: ReconnectScheduler::deadline
/// [`fire`]: ReconnectScheduler::fire
#[derive(Debug)]
pub struct ReconnectScheduler {
    peer: PeerId,
    policy: ReconnectPolicy,
    attempts: u32,
    deadline: Option<Instant>,
}

impl ReconnectScheduler {
    pub fn new(peer: PeerId, policy: ReconnectPolicy) -> Self {
        Self {
            peer,
            policy,
            attempts: 0,
            deadline: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn schedule(&mut self, now: Instant) -> ScheduleOutcome {
        if self.deadline.is_some() {
            return ScheduleOutcome::AlreadyArmed;
        }
        if self.attempts >= self.policy.max_attempts {
            warn!(
                target = "peer_mesh::reconnect",
                peer = %self.peer,
                attempts = self.attempts,
                max_attempts = self.policy.max_attempts,
                "reconnect attempts exhausted"
            );
            return ScheduleOutcome::Exhausted {
                attempts: self.attempts,
            };
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        self.deadline = Some(now + delay);
        debug!(
            target = "peer_mesh::reconnect",
            peer = %self.peer,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect attempt scheduled"
        );
        ScheduleOutcome::Armed {
            attempt: self.attempts,
            delay,
        }
    }

    /// Disarms the elapsed timer and returns the attempt number it was
    /// armed for.
    pub fn fire(&mut self) -> Option<u32> {
        self.deadline.take().map(|_| self.attempts)
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Connection succeeded: disarm and start counting from zero again.
    pub fn reset(&mut self) {
        self.deadline = None;
        self.attempts = 0;
    }
}
