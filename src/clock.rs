//! Clock reads and the consistency check run before a measurement starts.

use crate::timestamp::{Timestamp, NSEC_PER_SEC};
use crate::{Error, Result};
use log::{debug, info};

/// Number of back-to-back read pairs taken by [`sanity_check`].
const CHECK_ROUNDS: usize = 5;

/// Reads `clock`. Invalid clock ids yield the zero timestamp.
pub fn read(clock: libc::clockid_t) -> Timestamp {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec.
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    Timestamp::new(ts.tv_sec as i64, ts.tv_nsec as i64)
}

/// Declared resolution of `clock` in nanoseconds.
pub fn resolution(clock: libc::clockid_t) -> Result<i64> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid, writable timespec.
    let ret = unsafe { libc::clock_getres(clock, &mut ts) };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(ts.tv_sec as i64 * NSEC_PER_SEC + ts.tv_nsec as i64)
}

/// Verifies that two nearly simultaneous reads of `clock` agree.
///
/// A pair a full second or more apart is reported as [`Error::Timing`].
pub fn sanity_check(clock: libc::clockid_t) -> Result<()> {
    check_pairs((0..CHECK_ROUNDS).map(|_| {
        let first = read(clock);
        let second = read(clock);
        (first, second)
    }))
}

pub(crate) fn check_pairs<I>(pairs: I) -> Result<()>
where
    I: IntoIterator<Item = (Timestamp, Timestamp)>,
{
    let mut widest = 0;
    for (first, second) in pairs {
        let span = second.nanos_since(&first);
        if span.abs() >= NSEC_PER_SEC {
            return Err(Error::Timing(format!(
                "too long time diff between consecutive clock reads: {}ns",
                span
            )));
        }
        widest = widest.max(span);
    }
    debug!("Clock read pairs consistent, widest span {}ns", widest);
    Ok(())
}

/// Logs the declared resolution of the realtime clock.
pub fn log_resolution() {
    match resolution(libc::CLOCK_REALTIME) {
        Ok(ns) => info!("CLOCK_REALTIME declared resolution: {}ns", ns),
        Err(e) => info!("CLOCK_REALTIME resolution unavailable: {}", e),
    }
}
