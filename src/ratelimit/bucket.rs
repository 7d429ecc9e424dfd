//! Token bucket implementation.
//!
//! See <http://en.wikipedia.org/wiki/Token_bucket>.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{RateLimitError, Result};

/// Allowed relative difference between a requested rate and the rate a
/// bucket built by [`TokenBucket::with_rate`] actually achieves.
const RATE_MARGIN: f64 = 0.01;
/// Upper bound (exclusive) of the quantum search.
const MAX_QUANTUM: i64 = 1 << 62;
const NANOS_PER_SEC: f64 = 1e9;
const NANOS_PER_SEC_U128: u128 = 1_000_000_000;

/// A token bucket that fills at a predetermined rate.
///
/// The bucket starts full. Every `fill_interval` since construction credits
/// `quantum` tokens, up to `capacity`. Fill is computed from elapsed time on
/// each call, so no background timer is needed.
///
/// All methods take `&self` and may be called concurrently; share the bucket
/// with an `Arc`.
#[derive(Debug)]
pub struct TokenBucket {
    /// Reference instant all tick arithmetic is relative to
    start_time: Instant,
    /// Maximum number of tokens held
    capacity: i64,
    /// Tokens credited per tick
    quantum: i64,
    /// Length of one tick
    fill_interval: Duration,
    /// Mutable state, guarded for the reconcile + debit sequence only
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Tick at which `avail` was last reconciled
    avail_tick: i64,
    /// Available tokens; negative while callers owe a debt
    avail: i64,
}

impl BucketState {
    /// Credit the ticks elapsed since the last reconciliation.
    ///
    /// Returns the tick the state is now reconciled to, which is never
    /// earlier than a previously returned one.
    ///
    /// Unlike a plain short-circuit on a full bucket, `avail_tick` advances
    /// even when no credit is given. Otherwise ticks spent idle while full
    /// would be credited again after the next debit.
    fn adjust(&mut self, tick: i64, capacity: i64, quantum: i64) -> i64 {
        if tick <= self.avail_tick {
            return self.avail_tick;
        }
        let elapsed_ticks = tick - self.avail_tick;
        self.avail_tick = tick;

        if self.avail >= capacity {
            return tick;
        }
        self.avail = self
            .avail
            .saturating_add(elapsed_ticks.saturating_mul(quantum))
            .min(capacity);
        tick
    }
}

impl TokenBucket {
    /// Create a bucket that fills one token every `fill_interval`, up to
    /// `capacity` tokens.
    ///
    /// Fails if `fill_interval` is zero or `capacity` is not positive.
    pub fn new(fill_interval: Duration, capacity: i64) -> Result<Self> {
        Self::with_quantum(fill_interval, capacity, 1)
    }

    /// Create a bucket that fills at `rate` tokens per second, up to
    /// `capacity` tokens.
    ///
    /// Fill intervals have nanosecond resolution, so high rates are realized
    /// by crediting several tokens per tick. The achieved [`rate`](Self::rate)
    /// is within 1% of the requested one.
    pub fn with_rate(rate: f64, capacity: i64) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(RateLimitError::InvalidParameter(format!(
                "token bucket rate {} is not a positive finite number",
                rate
            )));
        }
        check_capacity(capacity)?;

        let mut quantum: i64 = 1;
        while quantum < MAX_QUANTUM {
            let fill_interval =
                Duration::from_nanos((NANOS_PER_SEC * quantum as f64 / rate) as u64);
            if !fill_interval.is_zero() {
                let actual = rate_of(quantum, fill_interval);
                if (actual - rate).abs() / rate <= RATE_MARGIN {
                    return Self::with_quantum(fill_interval, capacity, quantum);
                }
            }
            quantum *= 2;
        }

        Err(RateLimitError::InvalidParameter(format!(
            "cannot find suitable quantum for rate {}",
            rate
        )))
    }

    /// Create a bucket that credits `quantum` tokens every `fill_interval`,
    /// up to `capacity` tokens.
    pub fn with_quantum(fill_interval: Duration, capacity: i64, quantum: i64) -> Result<Self> {
        if fill_interval.is_zero() {
            return Err(RateLimitError::InvalidParameter(
                "token bucket fill interval is not > 0".to_string(),
            ));
        }
        check_capacity(capacity)?;
        if quantum <= 0 {
            return Err(RateLimitError::InvalidParameter(
                "token bucket quantum is not > 0".to_string(),
            ));
        }

        debug!(
            capacity = capacity,
            quantum = quantum,
            fill_interval = ?fill_interval,
            rate = rate_of(quantum, fill_interval),
            "Creating token bucket"
        );

        Ok(Self {
            start_time: Instant::now(),
            capacity,
            quantum,
            fill_interval,
            state: Mutex::new(BucketState {
                avail_tick: 0,
                avail: capacity,
            }),
        })
    }

    /// Fill rate of the bucket, in tokens per second.
    pub fn rate(&self) -> f64 {
        rate_of(self.quantum, self.fill_interval)
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Tokens credited per fill interval.
    pub fn quantum(&self) -> i64 {
        self.quantum
    }

    /// Duration of one fill tick.
    pub fn fill_interval(&self) -> Duration {
        self.fill_interval
    }

    /// Instant the bucket was created; ticks are counted from here.
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Take `count` tokens without blocking and return how long the caller
    /// should wait before the tokens are actually available.
    ///
    /// The take is irrevocable: the tokens are debited whether or not the
    /// caller waits, and there is no way to return them.
    pub fn take(&self, count: i64) -> Duration {
        self.take_at(Instant::now(), count)
    }

    /// Same as [`take`](Self::take), as of the given instant.
    pub fn take_at(&self, now: Instant, count: i64) -> Duration {
        if count <= 0 {
            return Duration::ZERO;
        }

        let (avail, wait) = {
            let mut state = self.state.lock();
            let tick = state.adjust(self.tick_at(now), self.capacity, self.quantum);
            // Debt is capped at i64::MAX so it can always be negated.
            state.avail = state.avail.saturating_sub(count).max(-i64::MAX);
            if state.avail >= 0 {
                return Duration::ZERO;
            }

            // The missing tokens arrive a whole quantum per tick, so round
            // the number of ticks up.
            let debt = -state.avail;
            let end_tick = tick.saturating_add(div_ceil(debt, self.quantum));
            let wait_nanos = self
                .tick_offset_nanos(end_tick)
                .saturating_sub(self.elapsed(now).as_nanos());
            (state.avail, duration_from_nanos(wait_nanos))
        };

        trace!(count = count, avail = avail, wait = ?wait, "Token bucket in debt");
        wait
    }

    /// Take `count` tokens, sleeping the current thread until they are
    /// available.
    pub fn wait(&self, count: i64) {
        let wait = self.take(count);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }

    /// Take `count` tokens, sleeping on the tokio timer until they are
    /// available.
    pub async fn wait_async(&self, count: i64) {
        let wait = self.take(count);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Take up to `count` immediately available tokens.
    ///
    /// Returns the number of tokens removed, which is zero if none are
    /// available. Never blocks and never puts the bucket into debt.
    pub fn take_available(&self, count: i64) -> i64 {
        self.take_available_at(Instant::now(), count)
    }

    /// Same as [`take_available`](Self::take_available), as of the given
    /// instant.
    pub fn take_available_at(&self, now: Instant, count: i64) -> i64 {
        if count <= 0 {
            return 0;
        }

        let mut state = self.state.lock();
        state.adjust(self.tick_at(now), self.capacity, self.quantum);
        if state.avail <= 0 {
            return 0;
        }
        let granted = count.min(state.avail);
        state.avail -= granted;
        granted
    }

    /// Tokens currently available; negative while the bucket is in debt.
    ///
    /// The value is a snapshot and may be stale by the time it is used.
    pub fn available(&self) -> i64 {
        self.available_at(Instant::now())
    }

    /// Same as [`available`](Self::available), as of the given instant.
    pub fn available_at(&self, now: Instant) -> i64 {
        let mut state = self.state.lock();
        state.adjust(self.tick_at(now), self.capacity, self.quantum);
        state.avail
    }

    fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    fn tick_at(&self, now: Instant) -> i64 {
        let ticks = self.elapsed(now).as_nanos() / self.fill_interval.as_nanos();
        i64::try_from(ticks).unwrap_or(i64::MAX)
    }

    /// Nanoseconds from the start instant at which `tick` begins.
    fn tick_offset_nanos(&self, tick: i64) -> u128 {
        self.fill_interval.as_nanos().saturating_mul(tick.max(0) as u128)
    }
}

fn check_capacity(capacity: i64) -> Result<()> {
    if capacity <= 0 {
        return Err(RateLimitError::InvalidParameter(
            "token bucket capacity is not > 0".to_string(),
        ));
    }
    Ok(())
}

fn rate_of(quantum: i64, fill_interval: Duration) -> f64 {
    NANOS_PER_SEC * quantum as f64 / fill_interval.as_nanos() as f64
}

/// Converts without truncating to `u64` nanoseconds, saturating at
/// `Duration::MAX`.
fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = nanos / NANOS_PER_SEC_U128;
    match u64::try_from(secs) {
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC_U128) as u32),
        Err(_) => Duration::MAX,
    }
}

fn div_ceil(n: i64, d: i64) -> i64 {
    n / d + i64::from(n % d != 0)
}
