//! Statistics over timestamp vectors.
//!
//! Everything here is pure: vectors in, series and summaries out. A sample is
//! only used where every vector involved captured it, so a missing hardware
//! stamp shrinks the sample count of the sections that need it instead of
//! skewing them.

use crate::timestamp::{Timestamp, TimestampVector, NSEC_PER_SEC, NSEC_PER_USEC};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-packet differences in nanoseconds. `None` where a capture was missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSeries {
    samples: Vec<Option<i64>>,
}

impl DeltaSeries {
    pub fn from_samples(samples: Vec<Option<i64>>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        self.samples.get(index).copied().flatten()
    }

    pub fn valid_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<i64>> + '_ {
        self.samples.iter().copied()
    }

    pub fn valid(&self) -> impl Iterator<Item = i64> + '_ {
        self.samples.iter().filter_map(|s| *s)
    }
}

/// Valid-sample counts of two vectors that were subtracted and disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountMismatch {
    pub minuend: usize,
    pub subtrahend: usize,
}

impl fmt::Display for CountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "valid sample counts differ: {} != {}",
            self.minuend, self.subtrahend
        )
    }
}

/// Result of [`diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub series: DeltaSeries,
    pub mismatch: Option<CountMismatch>,
}

/// Elementwise `a - b` over the indices valid in both.
///
/// Vectors of unequal length are compared over the shorter one.
///
/// ```
/// use rplget::stats::diff;
/// use rplget::timestamp::{Timestamp, TimestampVector};
///
/// let a = TimestampVector::from_samples(vec![Some(Timestamp::new(1, 500)), None]);
/// let b = TimestampVector::from_samples(vec![Some(Timestamp::new(1, 200)), Some(Timestamp::new(2, 0))]);
/// let d = diff(&a, &b);
/// assert_eq!(d.series.get(0), Some(300));
/// assert_eq!(d.series.get(1), None);
/// assert!(d.mismatch.is_some());
/// ```
pub fn diff(a: &TimestampVector, b: &TimestampVector) -> Diff {
    let samples = a
        .iter()
        .zip(b.iter())
        .map(|pair| match pair {
            (Some(x), Some(y)) => Some(x.nanos_since(&y)),
            _ => None,
        })
        .collect();

    let (na, nb) = (a.valid_count(), b.valid_count());
    Diff {
        series: DeltaSeries { samples },
        mismatch: (na != nb).then_some(CountMismatch {
            minuend: na,
            subtrahend: nb,
        }),
    }
}

/// Differences between consecutive valid samples.
///
/// A gap is only measured between neighbouring packets that were both
/// captured, so a lost capture does not produce a double-length gap.
pub fn gaps(v: &TimestampVector) -> DeltaSeries {
    let mut samples = Vec::with_capacity(v.len().saturating_sub(1));
    let mut prev: Option<Timestamp> = None;
    for (i, cur) in v.iter().enumerate() {
        if i > 0 {
            samples.push(match (prev, cur) {
                (Some(p), Some(c)) => Some(c.nanos_since(&p)),
                _ => None,
            });
        }
        prev = cur;
    }
    DeltaSeries { samples }
}

/// Samples relative to `baseline`, or to the vector's own first valid sample.
pub fn relative_to(v: &TimestampVector, baseline: Option<Timestamp>) -> DeltaSeries {
    let base = baseline.or_else(|| v.start_ts());
    let samples = v
        .iter()
        .map(|s| match (s, base) {
            (Some(ts), Some(b)) => Some(ts.nanos_since(&b)),
            _ => None,
        })
        .collect();
    DeltaSeries { samples }
}

/// Aggregate of a series, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub min_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
}

/// How a section is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    /// min/max/mean/count
    Aggregate,
    /// Every valid sample
    Plain,
}

/// A summarised series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Summarized {
    Aggregate(Option<Summary>),
    Plain(Vec<f64>),
}

impl Summarized {
    /// Valid samples that went into the summary.
    pub fn count(&self) -> usize {
        match self {
            Summarized::Aggregate(summary) => summary.map_or(0, |s| s.count),
            Summarized::Plain(values) => values.len(),
        }
    }
}

fn to_us(ns: i64) -> f64 {
    ns as f64 / NSEC_PER_USEC as f64
}

pub fn summarize(series: &DeltaSeries, mode: SummaryMode) -> Summarized {
    match mode {
        SummaryMode::Plain => Summarized::Plain(series.valid().map(to_us).collect()),
        SummaryMode::Aggregate => {
            let mut count = 0usize;
            let mut min = i64::MAX;
            let mut max = i64::MIN;
            let mut sum = 0i128;
            for ns in series.valid() {
                count += 1;
                min = min.min(ns);
                max = max.max(ns);
                sum += i128::from(ns);
            }
            if count == 0 {
                return Summarized::Aggregate(None);
            }
            Summarized::Aggregate(Some(Summary {
                count,
                min_us: to_us(min),
                max_us: to_us(max),
                mean_us: (sum as f64 / count as f64) / NSEC_PER_USEC as f64,
            }))
        }
    }
}

/// Capture point a vector was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Basis {
    Hardware,
    Software,
    Application,
}

impl Basis {
    pub fn name(&self) -> &'static str {
        match self {
            Basis::Hardware => "hw",
            Basis::Software => "sw",
            Basis::Application => "app",
        }
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Most precise vector with a valid first sample: hardware, then software,
/// then application.
pub fn best_available<'a>(
    hw: &'a TimestampVector,
    sw: &'a TimestampVector,
    app: &'a TimestampVector,
) -> (Basis, &'a TimestampVector) {
    if hw.start_ts().is_some() {
        (Basis::Hardware, hw)
    } else if sw.start_ts().is_some() {
        (Basis::Software, sw)
    } else {
        (Basis::Application, app)
    }
}

/// Round trip seen by this host: echoed arrival minus departure.
pub fn round_trip(best_tx: &TimestampVector, best_rx: &TimestampVector) -> Diff {
    diff(best_rx, best_tx)
}

/// Throughput achieved over a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub packets: usize,
    pub span_ns: i64,
    pub pps: f64,
    pub mbps: f64,
}

/// Rate over `packets` frames of `frame_size` bytes spread between the first
/// and last capture. Needs two packets and a positive span.
pub fn rate_between(
    first: Timestamp,
    last: Timestamp,
    packets: usize,
    frame_size: usize,
) -> Option<Rate> {
    let span_ns = last.nanos_since(&first);
    if packets < 2 || span_ns <= 0 {
        return None;
    }
    // n packets delimit n - 1 intervals
    let pps = (packets - 1) as f64 * NSEC_PER_SEC as f64 / span_ns as f64;
    Some(Rate {
        packets,
        span_ns,
        pps,
        mbps: pps * frame_size as f64 * 8.0 / 1_000_000.0,
    })
}

/// Throughput over the span between the first and last valid sample.
pub fn rate(v: &TimestampVector, frame_size: usize) -> Option<Rate> {
    rate_between(v.start_ts()?, v.last_ts()?, v.valid_count(), frame_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(values: &[Option<i64>]) -> TimestampVector {
        TimestampVector::from_samples(values.iter().map(|v| v.map(Timestamp::from_nanos)).collect())
    }

    #[test]
    fn test_diff_is_antisymmetric() {
        let a = ns(&[Some(100), Some(250), None, Some(1_000_000_007)]);
        let b = ns(&[Some(40), None, Some(3), Some(999_999_999)]);
        let ab = diff(&a, &b).series;
        let ba = diff(&b, &a).series;
        for i in 0..ab.len() {
            assert_eq!(ab.get(i), ba.get(i).map(|v| -v));
        }
        assert_eq!(ab.get(0), Some(60));
        assert_eq!(ab.get(3), Some(8));
        assert_eq!(ab.valid_count(), 2);
    }

    #[test]
    fn test_diff_reports_mismatch_only_when_counts_differ() {
        let a = ns(&[Some(1), Some(2)]);
        let b = ns(&[Some(0), Some(0)]);
        assert!(diff(&a, &b).mismatch.is_none());

        let c = ns(&[Some(0), None]);
        assert_eq!(
            diff(&a, &c).mismatch,
            Some(CountMismatch {
                minuend: 2,
                subtrahend: 1
            })
        );
    }

    #[test]
    fn test_summarize() {
        let series = DeltaSeries::from_samples(vec![Some(1000), None, Some(3000), Some(2000)]);
        match summarize(&series, SummaryMode::Aggregate) {
            Summarized::Aggregate(Some(s)) => {
                assert_eq!(s.count, 3);
                assert_eq!(s.min_us, 1.0);
                assert_eq!(s.max_us, 3.0);
                assert_eq!(s.mean_us, 2.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            summarize(&series, SummaryMode::Plain),
            Summarized::Plain(vec![1.0, 3.0, 2.0])
        );

        let empty = DeltaSeries::from_samples(vec![None, None]);
        assert_eq!(
            summarize(&empty, SummaryMode::Aggregate),
            Summarized::Aggregate(None)
        );
        assert_eq!(summarize(&empty, SummaryMode::Aggregate).count(), 0);
    }

    #[test]
    fn test_gaps_skip_missing_neighbours() {
        let v = ns(&[Some(0), Some(100), None, Some(400), Some(450)]);
        let g = gaps(&v);
        assert_eq!(g.len(), 4);
        assert_eq!(g.get(0), Some(100));
        assert_eq!(g.get(1), None);
        assert_eq!(g.get(2), None);
        assert_eq!(g.get(3), Some(50));
    }

    #[test]
    fn test_relative_time_override() {
        let v = ns(&[None, Some(500), Some(700)]);
        let own = relative_to(&v, None);
        assert_eq!(own.get(1), Some(0));
        assert_eq!(own.get(2), Some(200));

        let forced = relative_to(&v, Some(Timestamp::from_nanos(100)));
        assert_eq!(forced.get(1), Some(400));
        assert_eq!(forced.get(0), None);
    }

    #[test]
    fn test_best_available_falls_back() {
        let hw = ns(&[None, Some(5)]);
        let sw = ns(&[Some(1), Some(2)]);
        let app = ns(&[Some(0), Some(1)]);
        let empty = ns(&[None, None]);

        // start_ts only needs some valid sample
        assert_eq!(best_available(&hw, &sw, &app).0, Basis::Hardware);
        assert_eq!(best_available(&empty, &sw, &app).0, Basis::Software);
        assert_eq!(best_available(&empty, &empty, &app).0, Basis::Application);
    }

    #[test]
    fn test_round_trip_is_rx_minus_tx() {
        let tx = ns(&[Some(1000), Some(2000)]);
        let rx = ns(&[Some(1500), Some(2600)]);
        let rtt = round_trip(&tx, &rx);
        assert_eq!(rtt.series.get(0), Some(500));
        assert_eq!(rtt.series.get(1), Some(600));
    }

    #[test]
    fn test_rate() {
        // 11 packets, 10 intervals over 10ms: 1000 pps
        let v = ns(&(0..=10).map(|i| Some(i * 1_000_000)).collect::<Vec<_>>());
        let r = rate(&v, 125).unwrap();
        assert_eq!(r.packets, 11);
        assert!((r.pps - 1000.0).abs() < 1e-6);
        assert!((r.mbps - 1.0).abs() < 1e-9);

        assert!(rate(&ns(&[Some(5)]), 60).is_none());
        assert!(rate_between(Timestamp::from_nanos(5), Timestamp::from_nanos(5), 3, 60).is_none());
    }
}
