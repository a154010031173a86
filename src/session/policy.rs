use std::ops::RangeInclusive;
use std::time::Duration;

use crate::protocol::OpenObject;

/// Outcome of checking a peer's proposed session characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristics {
    Acceptable,
    /// not acceptable, but a counter proposal may fix it
    Negotiable,
    NotNegotiable,
}

/// Which keepalive and dead timer values this node accepts from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    pub keepalive: RangeInclusive<u8>,
    pub dead_timer: RangeInclusive<u8>,
    pub allow_negotiation: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        SessionPolicy {
            keepalive: 1..=255,
            dead_timer: 4..=255,
            allow_negotiation: true,
        }
    }
}

impl SessionPolicy {
    pub fn check(&self, open: &OpenObject) -> Characteristics {
        if self.keepalive.contains(&open.keepalive) && self.dead_timer.contains(&open.dead_timer)
        {
            return Characteristics::Acceptable;
        }
        // a dead timer shorter than the keepalive interval can never work
        let consistent = open.dead_timer == 0 || open.dead_timer >= open.keepalive;
        if self.allow_negotiation && consistent {
            Characteristics::Negotiable
        } else {
            Characteristics::NotNegotiable
        }
    }

    /// The closest acceptable values to what the peer proposed.
    ///
    /// Bounds are expected in order (config validation rejects inverted ones). With an
    /// inverted range the upper bound wins instead of panicking.
    pub fn counter_proposal(&self, open: &OpenObject, session_id: u8) -> OpenObject {
        debug_assert!(
            self.keepalive.start() <= self.keepalive.end()
                && self.dead_timer.start() <= self.dead_timer.end(),
            "inverted policy bounds {:?}",
            self
        );
        let keepalive = open
            .keepalive
            .max(*self.keepalive.start())
            .min(*self.keepalive.end());
        let dead_timer = open
            .dead_timer
            .max(*self.dead_timer.start())
            .min(*self.dead_timer.end())
            .max(keepalive.min(*self.dead_timer.end()));
        OpenObject::new(keepalive, dead_timer, session_id)
    }
}

/// Everything a session needs from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub open_wait: Duration,
    pub keep_wait: Duration,
    pub max_connect_retries: u32,
    /// seconds, proposed in our OPEN and used for our keepalive timer
    pub keepalive: u8,
    /// seconds, proposed in our OPEN
    pub dead_timer: u8,
    pub policy: SessionPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            connect_timeout: Duration::from_secs(60),
            open_wait: Duration::from_secs(60),
            keep_wait: Duration::from_secs(60),
            max_connect_retries: 5,
            keepalive: 30,
            dead_timer: 120,
            policy: SessionPolicy::default(),
        }
    }
}
