// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Bounded retry with exponential backoff, used for socket connects.

use std::time::Duration;

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(20);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Attempt-bounded exponential backoff.
///
/// `next_backoff` returns the delay to sleep before the next attempt, or
/// `None` once the attempt budget is exhausted.
pub struct RetryPolicy {
    max_attempts: u32,
    attempts_made: u32,
    multiplier: f64,
    max_delay: Duration,
    current_delay: Duration,
}

impl RetryPolicy {
    /// A policy allowing `max_attempts` attempts with default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self::with_delays(max_attempts, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_delays(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            attempts_made: 0,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay,
            current_delay: initial_delay,
        }
    }

    /// Record one failed attempt. Returns the jittered delay to sleep before
    /// retrying, or `None` when no attempts remain.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts_made += 1;
        if self.attempts_made >= self.max_attempts {
            return None;
        }
        let delay = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        // Jitter 0..+50% so simultaneous reconnecting clients spread out.
        let jitter = 1.0 + rand::random::<f64>() * 0.5;
        Some(Duration::from_secs_f64(delay.as_secs_f64() * jitter).min(self.max_delay))
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_budget() {
        let mut policy = RetryPolicy::new(3);
        assert!(policy.next_backoff().is_some());
        assert!(policy.next_backoff().is_some());
        assert!(policy.next_backoff().is_none());
        assert_eq!(policy.attempts_made(), 3);
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        let mut policy = RetryPolicy::new(1);
        assert!(policy.next_backoff().is_none());
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let mut policy =
            RetryPolicy::with_delays(100, Duration::from_millis(100), Duration::from_millis(250));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = policy.next_backoff().unwrap();
        }
        assert!(last <= Duration::from_millis(250));
    }
}
