//! Logical and wall-clock time.
//!
//! [`LamportClock`] totally orders operations across clients without relying
//! on synchronized wall clocks: counters are compared first and the origin
//! client id breaks ties. [`TimeSource`] abstracts the wall clock used for
//! lock expiry and presence last-seen bookkeeping so tests can drive it.
//!
//! Reference: Lamport, "Time, Clocks, and the Ordering of Events" (1978)

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A Lamport timestamp: `(counter, origin client id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalTimestamp {
    pub counter: u64,
    pub origin: String,
}

impl LogicalTimestamp {
    pub fn new(counter: u64, origin: impl Into<String>) -> Self {
        Self {
            counter,
            origin: origin.into(),
        }
    }

    /// The greater of two timestamps under the total order.
    ///
    /// Commutative and idempotent, so replicas that merge the same set of
    /// timestamps in any order agree on the result.
    pub fn merge(a: &LogicalTimestamp, b: &LogicalTimestamp) -> LogicalTimestamp {
        if a >= b {
            a.clone()
        } else {
            b.clone()
        }
    }

    /// Absolute counter distance, used for the concurrency window.
    pub fn distance(&self, other: &LogicalTimestamp) -> u64 {
        self.counter.abs_diff(other.counter)
    }
}

impl Ord for LogicalTimestamp {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for LogicalTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.origin)
    }
}

/// Per-client Lamport clock.
///
/// The counter never decreases. [`merge`](Self::merge) folds in a remote
/// timestamp without originating anything (`max(local, remote)`), and
/// [`tick`](Self::tick) is called for each locally-originated operation
/// (`+1`), so the first local operation after a merge lands at
/// `max(local, remote) + 1`.
#[derive(Debug, Clone)]
pub struct LamportClock {
    counter: u64,
    origin: String,
}

impl LamportClock {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            counter: 0,
            origin: origin.into(),
        }
    }

    pub fn current(&self) -> LogicalTimestamp {
        LogicalTimestamp::new(self.counter, self.origin.clone())
    }

    /// The timestamp the next local operation will carry, without advancing.
    pub fn peek_next(&self) -> LogicalTimestamp {
        LogicalTimestamp::new(self.counter + 1, self.origin.clone())
    }

    pub fn tick(&mut self) -> LogicalTimestamp {
        self.counter += 1;
        self.current()
    }

    pub fn merge(&mut self, remote: &LogicalTimestamp) {
        self.counter = self.counter.max(remote.counter);
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Wall-clock source in milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A manually driven clock for tests and simulations.
#[derive(Debug, Default, Clone)]
pub struct ManualTimeSource {
    now: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(counter: u64, origin: &str) -> LogicalTimestamp {
        LogicalTimestamp::new(counter, origin)
    }

    #[test]
    fn test_total_order_counter_first() {
        assert!(ts(1, "z") < ts(2, "a"));
        assert!(ts(5, "a") > ts(4, "b"));
    }

    #[test]
    fn test_total_order_ties_break_on_origin() {
        assert!(ts(3, "alice") < ts(3, "bob"));
        assert_eq!(ts(3, "alice").cmp(&ts(3, "alice")), CmpOrdering::Equal);
    }

    #[test]
    fn test_merge_takes_max_counter() {
        let merged = LogicalTimestamp::merge(&ts(4, "a"), &ts(9, "b"));
        assert_eq!(merged.counter, 9);
        assert_eq!(merged.origin, "b");
    }

    #[test]
    fn test_merge_commutative_and_idempotent() {
        let pairs = [
            (ts(1, "a"), ts(2, "b")),
            (ts(7, "b"), ts(7, "a")),
            (ts(0, "x"), ts(0, "x")),
            (ts(12, "c"), ts(3, "d")),
        ];
        for (a, b) in pairs {
            let ab = LogicalTimestamp::merge(&a, &b);
            let ba = LogicalTimestamp::merge(&b, &a);
            assert_eq!(ab, ba);
            assert_eq!(ab.counter, a.counter.max(b.counter));
            assert_eq!(LogicalTimestamp::merge(&ab, &ab), ab);
            assert_eq!(LogicalTimestamp::merge(&ab, &a), ab);
        }
    }

    #[test]
    fn test_clock_merge_without_new_operation() {
        let mut clock = LamportClock::new("me");
        clock.tick();
        clock.merge(&ts(10, "peer"));
        assert_eq!(clock.counter(), 10);

        // Stale remote does not move the clock backwards.
        clock.merge(&ts(3, "peer"));
        assert_eq!(clock.counter(), 10);
    }

    #[test]
    fn test_clock_next_local_after_merge() {
        let mut clock = LamportClock::new("me");
        clock.merge(&ts(41, "peer"));
        assert_eq!(clock.peek_next().counter, 42);
        let stamped = clock.tick();
        assert_eq!(stamped, ts(42, "me"));
    }

    #[test]
    fn test_distance() {
        assert_eq!(ts(10, "a").distance(&ts(250, "b")), 240);
        assert_eq!(ts(250, "a").distance(&ts(10, "b")), 240);
    }

    #[test]
    fn test_manual_time_source() {
        let time = ManualTimeSource::new(1_000);
        assert_eq!(time.now_ms(), 1_000);
        time.advance(Duration::from_secs(2));
        assert_eq!(time.now_ms(), 3_000);
        time.set(5);
        assert_eq!(time.now_ms(), 5);
    }

    #[test]
    fn test_timestamp_json_shape() {
        let json = serde_json::to_value(ts(7, "client-a")).unwrap();
        assert_eq!(json, serde_json::json!({ "counter": 7, "origin": "client-a" }));
    }
}
