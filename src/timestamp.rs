//! Capture timestamps and the per-run vectors that hold them.
//!
//! Every stage of the packet path (application, kernel software, NIC hardware,
//! packet scheduler hops) gets its own [`TimestampVector`]. Slot `i` of each
//! vector belongs to packet `i`, so vectors can be subtracted elementwise.
//! A capture that did not happen is stored as `None` rather than zero so that
//! the statistics engine can tell "missing" from "equal to baseline".

use serde::{Deserialize, Serialize};
use std::fmt;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;
pub const NSEC_PER_USEC: i64 = 1_000;

/// A (seconds, nanoseconds) capture, always normalised so `0 <= nsec < 1e9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self {
            sec: sec.saturating_add(nsec.div_euclid(NSEC_PER_SEC)),
            nsec: nsec.rem_euclid(NSEC_PER_SEC),
        }
    }

    pub fn from_nanos(ns: i64) -> Self {
        Self {
            sec: ns.div_euclid(NSEC_PER_SEC),
            nsec: ns.rem_euclid(NSEC_PER_SEC),
        }
    }

    /// Nanoseconds since the epoch, saturating beyond the `i64` range.
    pub fn as_nanos(&self) -> i64 {
        self.sec
            .saturating_mul(NSEC_PER_SEC)
            .saturating_add(self.nsec)
    }

    /// Signed difference `self - earlier` in nanoseconds.
    pub fn nanos_since(&self, earlier: &Timestamp) -> i64 {
        self.as_nanos().saturating_sub(earlier.as_nanos())
    }

    /// Converts a kernel timespec. The kernel zero-fills capture points it did
    /// not sample, so an all-zero timespec maps to `None`.
    pub fn from_timespec(ts: &libc::timespec) -> Option<Self> {
        if ts.tv_sec == 0 && ts.tv_nsec == 0 {
            None
        } else {
            Some(Self::new(ts.tv_sec as i64, ts.tv_nsec as i64))
        }
    }

    /// Application-level capture on `CLOCK_REALTIME`, the clock the kernel
    /// uses for software timestamps.
    pub fn now() -> Self {
        crate::clock::read(libc::CLOCK_REALTIME)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Ordered capture samples for one stage of the packet path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimestampVector {
    samples: Vec<Option<Timestamp>>,
}

impl TimestampVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sizes the vector for the run's packet-count target.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn from_samples(samples: Vec<Option<Timestamp>>) -> Self {
        Self { samples }
    }

    pub fn push(&mut self, sample: Option<Timestamp>) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Timestamp> {
        self.samples.get(index).copied().flatten()
    }

    pub fn valid_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_some()).count()
    }

    /// First valid sample; the default baseline for relative output.
    pub fn start_ts(&self) -> Option<Timestamp> {
        self.samples.iter().find_map(|s| *s)
    }

    pub fn last_ts(&self) -> Option<Timestamp> {
        self.samples.iter().rev().find_map(|s| *s)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<Timestamp>> + '_ {
        self.samples.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_normalisation() {
        let ts = Timestamp::new(1, 1_500_000_000);
        assert_eq!(ts, Timestamp { sec: 2, nsec: 500_000_000 });

        let neg = Timestamp::from_nanos(-1);
        assert_eq!(neg, Timestamp { sec: -1, nsec: 999_999_999 });
        assert_eq!(neg.as_nanos(), -1);
    }

    #[test]
    fn test_nanos_since() {
        let a = Timestamp::new(10, 100);
        let b = Timestamp::new(9, 999_999_900);
        assert_eq!(a.nanos_since(&b), 200);
        assert_eq!(b.nanos_since(&a), -200);
    }

    #[test]
    fn test_extreme_seconds_saturate() {
        let far = Timestamp { sec: i64::MAX / 2, nsec: 0 };
        assert_eq!(far.as_nanos(), i64::MAX);
        assert_eq!(far.nanos_since(&Timestamp::from_nanos(-1)), i64::MAX);

        let ts = Timestamp::new(i64::MAX, 2 * NSEC_PER_SEC + 5);
        assert_eq!(ts, Timestamp { sec: i64::MAX, nsec: 5 });

        let back: Timestamp = serde_json::from_str(r#"{"sec":9223372036854775807,"nsec":0}"#).unwrap();
        assert_eq!(back.as_nanos(), i64::MAX);
    }

    #[test]
    fn test_zero_timespec_is_absent() {
        let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        assert!(Timestamp::from_timespec(&zero).is_none());

        let set = libc::timespec { tv_sec: 5, tv_nsec: 7 };
        assert_eq!(Timestamp::from_timespec(&set), Some(Timestamp::new(5, 7)));
    }

    #[test]
    fn test_start_ts_skips_invalid_slots() {
        let mut v = TimestampVector::with_capacity(4);
        v.push(None);
        v.push(Some(Timestamp::new(3, 0)));
        v.push(None);
        v.push(Some(Timestamp::new(4, 0)));

        assert_eq!(v.len(), 4);
        assert_eq!(v.valid_count(), 2);
        assert_eq!(v.start_ts(), Some(Timestamp::new(3, 0)));
        assert_eq!(v.last_ts(), Some(Timestamp::new(4, 0)));
        assert_eq!(v.get(0), None);
        assert_eq!(v.get(9), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::new(12, 34).to_string(), "12.000000034");
    }
}
