// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Token bucket with reservations
//!
//! Tokens accrue continuously at the refill rate up to the capacity. When a
//! token is short by a deficit that will refill within `max_delay`, the
//! request reserves it: the bucket is emptied and its refill clock moves
//! into the future by the wait, so later requests queue behind it. Tokens
//! therefore stay within `[0, capacity]` at all times.

use std::time::{Duration, Instant};

use crate::config::ClassBudget;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketDecision {
    Admit,
    /// Token reserved; proceed after waiting
    Delay(Duration),
    /// Wait until a token would be free, when one ever will
    Reject(Option<Duration>),
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    /// Time up to which refill has been accounted; ahead of `now` while reserved
    last_refill: Instant,
}

impl TokenBucket {
    pub fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    /// Tokens available at `now` without taking any
    pub fn available(&self, now: Instant, budget: &ClassBudget, rate_factor: f64) -> f64 {
        if now <= self.last_refill {
            return self.tokens;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * budget.refill_rate * rate_factor).min(budget.capacity)
    }

    pub fn try_acquire(
        &mut self,
        now: Instant,
        budget: &ClassBudget,
        rate_factor: f64,
    ) -> BucketDecision {
        let rate = budget.refill_rate * rate_factor;
        self.refill(now, budget.capacity, rate);

        if self.last_refill <= now && self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return BucketDecision::Admit;
        }

        if rate <= 0.0 {
            return BucketDecision::Reject(None);
        }

        let pending = self.last_refill.saturating_duration_since(now);
        let deficit = (1.0 - self.tokens).max(0.0);
        // A rate too small to express the wait in a Duration never frees a token
        let wait = match Duration::try_from_secs_f64(deficit / rate)
            .ok()
            .and_then(|refill| pending.checked_add(refill))
        {
            Some(wait) => wait,
            None => return BucketDecision::Reject(None),
        };

        if wait <= budget.max_delay {
            self.tokens = 0.0;
            self.last_refill = now + wait;
            BucketDecision::Delay(wait)
        } else {
            BucketDecision::Reject(Some(wait))
        }
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }
}
