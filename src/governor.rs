//! Request-count rate governor.
//!
//! The search account tolerates bursts of about a hundred requests before it
//! starts rejecting, so the governor counts network calls and pauses the
//! calling thread for a fixed cooldown once the count passes the threshold.
//! Cache hits never reach it.

use std::thread;
use std::time::Duration;

use crate::config::LinkerConfig;

#[derive(Debug)]
pub struct RateGovernor {
    threshold: u32,
    cooldown: Duration,
    count: u32,
    cooldowns: u64,
}

impl RateGovernor {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            count: 0,
            cooldowns: 0,
        }
    }

    pub fn from_config(config: &LinkerConfig) -> Self {
        Self::new(config.requests_before_cooldown, config.cooldown())
    }

    /// Call once per network lookup, immediately before issuing it. Blocks
    /// for the cooldown when the counter passes the threshold, then starts
    /// counting again from zero.
    pub fn before_call(&mut self) {
        self.count = self.count.saturating_add(1);
        if self.count > self.threshold {
            tracing::info!(
                "Rate governor: {} requests issued, cooling down for {:?}",
                self.threshold,
                self.cooldown
            );
            if !self.cooldown.is_zero() {
                thread::sleep(self.cooldown);
            }
            self.count = 0;
            self.cooldowns += 1;
        }
    }

    /// Calls counted since the last cooldown.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn cooldowns(&self) -> u64 {
        self.cooldowns
    }
}
