use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::Rng;

/// Hands out the session id carried in our OPEN objects.
///
/// Cycles through 1..=255, 0 is never used. Shared by all sessions of one engine.
#[derive(Debug)]
pub struct SessionIdGenerator {
    next: Mutex<u8>,
}

impl SessionIdGenerator {
    /// Starts at a random id so restarted nodes do not reuse the previous sequence.
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(1..=u8::MAX))
    }

    pub fn starting_at(first: u8) -> Self {
        SessionIdGenerator {
            next: Mutex::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> u8 {
        let mut next = self.next.lock();
        let id = *next;
        *next = if id == u8::MAX { 1 } else { id + 1 };
        id
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle of one armed timer. Tokens are never reused within an engine.
pub type TimerToken = u64;

#[derive(Debug)]
pub struct TimerTokenGenerator {
    next: AtomicU64,
}

impl TimerTokenGenerator {
    pub fn new() -> Self {
        TimerTokenGenerator {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_token(&self) -> TimerToken {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TimerTokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}
