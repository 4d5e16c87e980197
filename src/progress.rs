//! Progress bar rendered from the driver's packet counter.
//!
//! The driver runs on a blocking thread and only bumps an atomic counter; this
//! task samples it once per period, so rendering never touches the packet
//! path.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const PROGRESS_LABEL: &str = "Measuring: ";
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);
const BAR_WIDTH: usize = 40;

/// Renders one progress line.
///
/// # Examples
///
/// ```
/// use rplget::progress::render_bar;
///
/// let line = render_bar("Measuring: ", 50, Some(100), 10);
/// assert_eq!(line, "Measuring: [#####     ]  50% (50/100)");
///
/// // Runs without a target only count
/// assert_eq!(render_bar("Measuring: ", 7, None, 10), "Measuring: 7 packets");
/// ```
pub fn render_bar(label: &str, done: u64, target: Option<u64>, width: usize) -> String {
    match target {
        Some(total) if total > 0 => {
            let done = done.min(total);
            let filled = (done as u128 * width as u128 / total as u128) as usize;
            let percent = done as u128 * 100 / total as u128;
            format!(
                "{}[{}{}] {:3}% ({}/{})",
                label,
                "#".repeat(filled),
                " ".repeat(width - filled),
                percent,
                done,
                total
            )
        }
        _ => format!("{}{} packets", label, done),
    }
}

/// Samples `counter` every `period` and hands each rendered line to `sink`
/// until the counter reaches `target` or `cancel` fires. Returns the last
/// value seen.
pub async fn run_progress_task<F>(
    counter: Arc<AtomicU64>,
    target: Option<u64>,
    period: Duration,
    cancel: CancellationToken,
    mut sink: F,
) -> u64
where
    F: FnMut(&str),
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                let done = counter.load(Ordering::Relaxed);
                sink(&render_bar(PROGRESS_LABEL, done, target, BAR_WIDTH));
                return done;
            }
        }

        let done = counter.load(Ordering::Relaxed);
        sink(&render_bar(PROGRESS_LABEL, done, target, BAR_WIDTH));
        if target.is_some_and(|t| done >= t) {
            return done;
        }
    }
}

/// Sink that redraws the bar in place on stderr.
pub fn stderr_sink(line: &str) {
    let mut err = std::io::stderr().lock();
    let _ = write!(err, "\r{}", line);
    let _ = err.flush();
}
