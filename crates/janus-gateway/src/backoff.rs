// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! Retry delay schedule with cryptographically jittered growth.
//!
//! The delay mixes a deterministic growth term (`factor * retry * grow`) with
//! a heavy-tailed jitter sampled from an integer interval that widens
//! exponentially with the retry count, then clamps the result to
//! `[min, max]`. The widening interval keeps early retries tight while
//! letting later retries spread out, which is what matters when the remote
//! endpoint is flapping and many producers are retrying at once.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::Rng;

/// Jitter sentinel used when the division blows up; large enough that the
/// resulting delay always clamps to `max`.
const OVERFLOW_JITTER: f64 = 16_000_000.0;

/// Parameters for the retry delay schedule.
///
/// `max_exp` values outside `1..=60` are treated as 60 at sample time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Base delay added to every retry.
    pub interval: Duration,
    /// Multiplier on the growth term.
    pub factor: f64,
    /// Growth per retry; the jitter scales this.
    pub grow: Duration,
    /// Lower clamp; `0` disables the lower bound.
    pub min: Duration,
    /// Upper clamp; `0` disables the upper bound.
    pub max: Duration,
    /// Cap on the exponent used to widen the jitter sampling interval.
    pub max_exp: u32,
    /// Offset added to the jitter divisor, keeping small retry counts sane.
    pub exp_m: f64,
    /// Overall jitter scale; `0` leaves the raw quotient.
    pub exp_scale: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            interval: Duration::from_secs(15),
            factor: 1.0,
            grow: Duration::from_secs(1),
            min: Duration::from_secs(7),
            max: Duration::from_secs(180),
            max_exp: 20,
            exp_m: 1.0,
            exp_scale: 1.5,
        }
    }
}

impl Backoff {
    /// Checks parameter invariants. Called by the config front-end after
    /// deserialization; the sampling functions assume these hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.factor <= 0.0 {
            return Err("backoff: factor must be > 0".to_string());
        }
        if self.max < self.min {
            return Err("backoff: max must be >= min".to_string());
        }
        if self.exp_m < 0.0 {
            return Err("backoff: exp-m must be >= 0".to_string());
        }
        if self.exp_scale < 0.0 {
            return Err("backoff: exp-y must be >= 0".to_string());
        }
        Ok(())
    }

    /// Samples the jitter term for the given retry count.
    ///
    /// The sampling interval is `[0, M)` where `M = 128 + 2^r` grown by
    /// `M + (M << (r-1)) + 128`; with `r` capped at 60 the magnitude stays
    /// below 2^122, so `u128` arithmetic covers the whole range. The random
    /// source is the OS RNG; if it fails the process aborts, since running a
    /// retry schedule on a broken RNG is worse than not running at all.
    fn rand_factor(&self, retry: u32) -> f64 {
        if retry < 1 {
            return 0.0;
        }

        let max_exp = if self.max_exp == 0 || self.max_exp > 60 {
            60
        } else {
            self.max_exp
        };
        let retry = retry.min(max_exp);

        let mut magnitude: u128 = 128 + (1u128 << retry);
        magnitude = magnitude + (magnitude << (retry - 1)) + 128;

        let n: u128 = OsRng.gen_range(0..magnitude);

        let divisor = magnitude as f64 / 4.0 + self.exp_m;
        let mut jitter = n as f64 / divisor;
        if self.exp_scale > 0.0 {
            jitter *= self.exp_scale;
        }
        if jitter.is_infinite() {
            jitter = OVERFLOW_JITTER;
        }

        jitter
    }

    /// Returns the delay before retry number `retry`.
    ///
    /// `retry < 1` yields `min`. The `max_retries` argument is accepted for
    /// signature compatibility with callers that track a retry budget; the
    /// schedule itself does not depend on it.
    pub fn delay(&self, retry: u32, _max_retries: u32) -> Duration {
        if retry < 1 {
            return self.min;
        }

        let mut next = self.interval.as_secs_f64();
        let growth = self.factor * f64::from(retry) * self.grow.as_secs_f64();
        if growth > 0.0 {
            next += growth * self.rand_factor(retry);
        }

        let min = self.min.as_secs_f64();
        let max = self.max.as_secs_f64();
        if !next.is_finite() {
            next = if max > 0.0 { max } else { 0.0 };
        } else if next < 0.0 {
            next = 0.0;
        } else if min > 0.0 && next < min {
            next = min;
        } else if max > 0.0 && next > max {
            next = max;
        }

        Duration::from_secs_f64(next)
    }
}
