//! Send pacing.
//!
//! The interval comes from the packets-per-second setting. After each send the
//! driver sleeps whatever is left of the interval, so the time spent sending
//! and collecting tx timestamps counts towards it. A send that already took
//! longer than the interval is followed immediately by the next one; missed
//! slots are not caught up.

use std::thread;
use std::time::{Duration, Instant};

/// Paces a synchronous send loop.
///
/// # Examples
///
/// ```
/// use rplget::pacer::Pacer;
/// use std::time::{Duration, Instant};
///
/// let mut pacer = Pacer::new(Some(Duration::from_millis(5)));
/// let start = Instant::now();
/// pacer.mark();
/// pacer.wait();
/// assert!(start.elapsed() >= Duration::from_millis(5));
/// ```
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Option<Duration>,
    /// Earliest instant the next send may happen
    next: Option<Instant>,
}

impl Pacer {
    /// `None` disables pacing altogether.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Records a send at this instant.
    pub fn mark(&mut self) {
        if let Some(interval) = self.interval {
            self.next = Some(Instant::now() + interval);
        }
    }

    /// Time left until the next send is due.
    pub fn remaining(&self) -> Duration {
        self.next
            .map(|next| next.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Sleeps out the rest of the interval since the last [`Pacer::mark`].
    pub fn wait(&mut self) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
    }
}
