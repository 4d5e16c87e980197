//! Run report: latency breakdown sections, packet count, frame size and rate.
//!
//! [`RunReport::build`] is the only place that decides which sections a run
//! prints. The report serialises to JSON as is, and its `Display` output is
//! the text shown on the terminal.

use crate::config::{Mode, OutputFormat, PacketType, RunConfig, RunOption};
use crate::driver::{RunSamples, RxVectors, TxVectors};
use crate::packet;
use crate::stats::{self, Basis, CountMismatch, Rate, Summarized, SummaryMode};
use crate::timestamp::{Timestamp, TimestampVector};
use crate::Result;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host and tool identification for the report header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub version: String,
    pub system_info: String,
    pub timestamp: i64,
    pub timestamp_str: String,
}

pub fn run_info() -> RunInfo {
    let now = chrono::Utc::now();
    RunInfo {
        version: format!("rplget {}", env!("CARGO_PKG_VERSION")),
        system_info: format!(
            "{} {} {}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        ),
        timestamp: now.timestamp(),
        timestamp_str: now.to_rfc2822(),
    }
}

/// One titled block of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub values: Summarized,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mismatch: Option<CountMismatch>,
}

/// Round trip section together with the capture points it was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundTripSection {
    pub tx_basis: Basis,
    pub rx_basis: Basis,
    pub section: Section,
}

/// Echo and round-trip runs whose rx and tx sample counts disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionMismatch {
    pub rx: usize,
    pub tx: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub info: RunInfo,
    pub mode: Mode,
    pub packet_type: PacketType,
    pub tx_sections: Vec<Section>,
    pub rx_sections: Vec<Section>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip: Option<RoundTripSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction_mismatch: Option<DirectionMismatch>,
    pub packets: u64,
    pub frame_size: Option<usize>,
    pub rate: Option<Rate>,
    pub rate_basis: Option<Basis>,
}

struct SectionBuilder {
    mode: SummaryMode,
    sections: Vec<Section>,
}

impl SectionBuilder {
    fn new(mode: SummaryMode) -> Self {
        Self {
            mode,
            sections: Vec::new(),
        }
    }

    fn series(&mut self, title: impl Into<String>, series: &stats::DeltaSeries) {
        self.sections.push(Section {
            title: title.into(),
            values: stats::summarize(series, self.mode),
            mismatch: None,
        });
    }

    fn diff(&mut self, title: impl Into<String>, a: &TimestampVector, b: &TimestampVector) {
        let d = stats::diff(a, b);
        self.sections.push(Section {
            title: title.into(),
            values: stats::summarize(&d.series, self.mode),
            mismatch: d.mismatch,
        });
    }
}

fn tx_sections(
    config: &RunConfig,
    mode: SummaryMode,
    tx: &TxVectors,
    rx: Option<&RxVectors>,
) -> Vec<Section> {
    let mut out = SectionBuilder::new(mode);

    if config.has_format(OutputFormat::Lat) {
        out.diff(
            "dma + NIC tx latency, us (not complete driver latency, driver s/w ts -> wire)",
            &tx.hw,
            &tx.sw,
        );
        out.diff(
            "stack + packet scheduler + part of driver tx latency, us (app -> driver s/w ts)",
            &tx.sw,
            &tx.app,
        );
        out.diff(
            "complete tx latency, us (driver latency + stack latency, app -> wire)",
            &tx.hw,
            &tx.app,
        );
    }

    if config.has_format(OutputFormat::Sched) {
        if let Some(first) = tx.sched.first() {
            out.diff(
                "stack tx latency, us (based on s/w timestamps, app -> packet scheduler)",
                first,
                &tx.app,
            );
            let mut prev = first;
            for (i, hop) in tx.sched.iter().enumerate().skip(1) {
                out.diff(
                    format!(
                        "between device (sched) tx latency, us (psched{} -> psched{})",
                        i,
                        i + 1
                    ),
                    hop,
                    prev,
                );
                prev = hop;
            }
            out.diff(
                "packet scheduler + part of driver tx latency, us (packet scheduler -> driver s/w ts)",
                &tx.sw,
                prev,
            );
            out.diff(
                "driver + packet scheduler tx latency, us (packet scheduler entrance -> wire)",
                &tx.hw,
                prev,
            );
        }
    }

    if config.has_format(OutputFormat::Hwts) {
        let baseline = config.relative_time.or_else(|| match (config.mode, rx) {
            (Mode::EchoLatency, Some(rx)) => rx.hw.start_ts(),
            _ => tx.hw.start_ts(),
        });
        out.series("hw tx time, us", &stats::relative_to(&tx.hw, baseline));
    }

    if config.has_format(OutputFormat::Ipgap) {
        let (title, v) = if config.has_option(RunOption::DisableHwTimestamps) {
            ("gap of sw tx time, us", &tx.sw)
        } else {
            ("gap of hw tx time, us", &tx.hw)
        };
        out.series(title, &stats::gaps(v));
    }

    out.sections
}

fn rx_sections(
    config: &RunConfig,
    mode: SummaryMode,
    rx: &RxVectors,
    tx: Option<&TxVectors>,
) -> Vec<Section> {
    let mut out = SectionBuilder::new(mode);

    if config.has_format(OutputFormat::Hwts) {
        let baseline = config.relative_time.or_else(|| match (config.mode, tx) {
            (Mode::RoundTrip, Some(tx)) => tx.hw.start_ts(),
            _ => rx.hw.start_ts(),
        });
        out.series("hw rx time, us", &stats::relative_to(&rx.hw, baseline));
    }

    if config.has_format(OutputFormat::Ipgap) {
        let (title, v) = if config.has_option(RunOption::DisableHwTimestamps) {
            ("gap of sw rx time, us", &rx.sw)
        } else {
            ("gap of hw rx time, us", &rx.hw)
        };
        out.series(title, &stats::gaps(v));
    }

    if config.has_format(OutputFormat::Lat) {
        out.diff(
            "driver rx latency, us (no stack latency, wire -> net subsystem)",
            &rx.sw,
            &rx.hw,
        );
        out.diff(
            "stack rx latency, us (no driver latency, net subsystem -> app)",
            &rx.app,
            &rx.sw,
        );
        out.diff(
            "complete rx latency, us (driver latency + stack latency, wire -> app)",
            &rx.app,
            &rx.hw,
        );
    }

    out.sections
}

fn round_trip_section(mode: SummaryMode, tx: &TxVectors, rx: &RxVectors) -> RoundTripSection {
    let (tx_basis, best_tx) = tx.best();
    let (rx_basis, best_rx) = rx.best();
    let d = stats::round_trip(best_tx, best_rx);
    RoundTripSection {
        tx_basis,
        rx_basis,
        section: Section {
            title: "RTT (no rx/tx latencies of this HOST), us".into(),
            values: stats::summarize(&d.series, mode),
            mismatch: d.mismatch,
        },
    }
}

fn direction_counts(rx: &RxVectors, tx: &TxVectors) -> (u64, Option<DirectionMismatch>) {
    let n_rx = rx.best().1.valid_count();
    let n_tx = tx.best().1.valid_count();
    if n_rx != n_tx {
        warn!("rx ts num != tx ts num: {} != {}", n_rx, n_tx);
        let mismatch = DirectionMismatch { rx: n_rx, tx: n_tx };
        return (n_rx.min(n_tx) as u64, Some(mismatch));
    }
    (n_rx as u64, None)
}

fn derived_frame_size(config: &RunConfig, payload_len: Option<usize>) -> Option<usize> {
    payload_len.map(|len| packet::frame_size_from_rx(config.transport(), len))
}

fn span_rate(
    first: Option<Timestamp>,
    last: Option<Timestamp>,
    packets: u64,
    frame_size: Option<usize>,
) -> Option<Rate> {
    stats::rate_between(first?, last?, packets as usize, frame_size.unwrap_or(0))
}

impl RunReport {
    pub fn build(config: &RunConfig, samples: &RunSamples) -> Self {
        let mode = if config.has_format(OutputFormat::Plain) {
            SummaryMode::Plain
        } else {
            SummaryMode::Aggregate
        };

        let mut report = RunReport {
            info: run_info(),
            mode: samples.mode(),
            packet_type: config.packet_type,
            tx_sections: Vec::new(),
            rx_sections: Vec::new(),
            round_trip: None,
            direction_mismatch: None,
            packets: samples.packets(),
            frame_size: config.frame_size,
            rate: None,
            rate_basis: None,
        };

        match samples {
            RunSamples::Generate { sent, first, last } => {
                report.packets = *sent;
                report.rate = span_rate(*first, *last, *sent, report.frame_size);
                report.rate_basis = Some(Basis::Application);
            }
            RunSamples::TransmitLatency { tx } => {
                report.tx_sections = tx_sections(config, mode, tx, None);
                let (basis, best) = tx.best();
                report.packets = best.valid_count() as u64;
                report.rate = stats::rate(best, report.frame_size.unwrap_or(0));
                report.rate_basis = Some(basis);
            }
            RunSamples::ReceiveLatency { rx, payload_len } => {
                report.rx_sections = rx_sections(config, mode, rx, None);
                report.frame_size = derived_frame_size(config, *payload_len);
                let (basis, best) = rx.best();
                report.packets = best.valid_count() as u64;
                report.rate = stats::rate(best, report.frame_size.unwrap_or(0));
                report.rate_basis = Some(basis);
            }
            RunSamples::EchoLatency {
                rx,
                tx,
                payload_len,
            } => {
                report.tx_sections = tx_sections(config, mode, tx, Some(rx));
                report.rx_sections = rx_sections(config, mode, rx, Some(tx));
                let (packets, mismatch) = direction_counts(rx, tx);
                report.packets = packets;
                report.direction_mismatch = mismatch;
                report.frame_size = derived_frame_size(config, *payload_len);
                let (basis, best) = rx.best();
                report.rate = stats::rate(best, report.frame_size.unwrap_or(0));
                report.rate_basis = Some(basis);
            }
            RunSamples::RoundTrip { tx, rx } => {
                report.tx_sections = tx_sections(config, mode, tx, Some(rx));
                report.rx_sections = rx_sections(config, mode, rx, Some(tx));
                let (packets, mismatch) = direction_counts(rx, tx);
                report.packets = packets;
                report.direction_mismatch = mismatch;
                report.round_trip = Some(round_trip_section(mode, tx, rx));
                let (basis, best) = tx.best();
                report.rate = stats::rate(best, report.frame_size.unwrap_or(0));
                report.rate_basis = Some(basis);
            }
            RunSamples::ReceiveRate {
                received,
                first,
                last,
                payload_len,
            } => {
                report.packets = *received;
                report.frame_size = derived_frame_size(config, *payload_len);
                report.rate = span_rate(*first, *last, *received, report.frame_size);
                report.rate_basis = Some(Basis::Application);
            }
        }

        report
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n{}", self.title)?;
        match &self.values {
            Summarized::Aggregate(Some(s)) => writeln!(
                f,
                "  min {:.3}  max {:.3}  mean {:.3}  count {}",
                s.min_us, s.max_us, s.mean_us, s.count
            )?,
            Summarized::Aggregate(None) => writeln!(f, "  no valid samples")?,
            Summarized::Plain(values) if values.is_empty() => writeln!(f, "  no valid samples")?,
            Summarized::Plain(values) => {
                for v in values {
                    writeln!(f, "  {:.3}", v)?;
                }
            }
        }
        if let Some(mismatch) = self.mismatch {
            writeln!(f, "  note: {}", mismatch)?;
        }
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} on {}", self.info.version, self.info.system_info)?;
        writeln!(f, "{}", self.info.timestamp_str)?;
        writeln!(f, "mode: {}, packet type: {}", self.mode, self.packet_type)?;

        for section in self.tx_sections.iter().chain(self.rx_sections.iter()) {
            write!(f, "{}", section)?;
        }

        if let Some(m) = self.direction_mismatch {
            writeln!(f, "\nrx ts num != tx ts num: {} != {}", m.rx, m.tx)?;
        }

        if let Some(rtt) = &self.round_trip {
            writeln!(
                f,
                "\nRTT (round trip time) for this HOST based on tx {} and rx {} timestamps",
                rtt.tx_basis, rtt.rx_basis
            )?;
            write!(f, "{}", rtt.section)?;
        }

        writeln!(f)?;
        if let Some(size) = self.frame_size {
            writeln!(f, "Frame size: {}", size)?;
        }
        writeln!(f, "number of packets: {}", self.packets)?;
        if let Some(rate) = self.rate {
            writeln!(
                f,
                "rate: {:.1} pps, {:.3} Mbps over {:.6}s ({} timestamps)",
                rate.pps,
                rate.mbps,
                rate.span_ns as f64 / 1e9,
                self.rate_basis.map_or("app", |b| b.name())
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacketType;

    fn vector(ns: &[Option<i64>]) -> TimestampVector {
        TimestampVector::from_samples(ns.iter().map(|v| v.map(Timestamp::from_nanos)).collect())
    }

    fn tx_vectors() -> TxVectors {
        TxVectors {
            app: vector(&[Some(0), Some(1_000_000)]),
            sw: vector(&[Some(10_000), Some(1_012_000)]),
            hw: vector(&[Some(15_000), None]),
            sched: vec![vector(&[Some(4_000), Some(1_005_000)])],
        }
    }

    fn titles(sections: &[Section]) -> Vec<&str> {
        sections.iter().map(|s| s.title.as_str()).collect()
    }

    #[test]
    fn test_tx_latency_sections() {
        let config = RunConfig::transmit_latency(PacketType::PtpL4)
            .with_packet_count(2)
            .with_format(OutputFormat::Sched)
            .with_dev_deep(1)
            .validate()
            .unwrap();
        let report = RunReport::build(&config, &RunSamples::TransmitLatency { tx: tx_vectors() });

        let titles = titles(&report.tx_sections);
        assert_eq!(titles.len(), 6);
        assert!(titles[0].starts_with("dma + NIC"));
        assert!(titles[3].starts_with("stack tx latency"));
        assert!(report.rx_sections.is_empty());

        // dma + NIC: hw - sw over the one packet with both
        match &report.tx_sections[0].values {
            Summarized::Aggregate(Some(s)) => {
                assert_eq!(s.count, 1);
                assert_eq!(s.mean_us, 5.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(report.tx_sections[0].mismatch.is_some());

        // hw has a valid start, so the rate basis is hardware
        assert_eq!(report.rate_basis, Some(Basis::Hardware));
        assert_eq!(report.packets, 1);
    }

    #[test]
    fn test_receive_latency_derives_frame_size() {
        let config = RunConfig::receive_latency(PacketType::Udp)
            .with_port(5000)
            .with_packet_count(2)
            .validate()
            .unwrap();
        let rx = RxVectors {
            app: vector(&[Some(100), Some(200)]),
            sw: vector(&[Some(50), Some(150)]),
            hw: vector(&[None, None]),
        };
        let samples = RunSamples::ReceiveLatency {
            rx,
            payload_len: Some(100),
        };
        let report = RunReport::build(&config, &samples);
        assert_eq!(report.frame_size, Some(14 + 28 + 100));
        assert_eq!(report.rate_basis, Some(Basis::Software));
        assert_eq!(report.rx_sections.len(), 3);

        let text = report.to_string();
        assert!(text.contains("Frame size: 142"));
        assert!(text.contains("number of packets: 2"));
    }

    #[test]
    fn test_round_trip_uses_smaller_count() {
        let config = RunConfig::round_trip(PacketType::PtpL4)
            .with_packet_count(2)
            .validate()
            .unwrap();
        let tx = TxVectors {
            app: vector(&[Some(0), Some(1_000)]),
            sw: vector(&[None, None]),
            hw: vector(&[None, None]),
            sched: Vec::new(),
        };
        let rx = RxVectors {
            app: vector(&[Some(500), None]),
            sw: vector(&[None, None]),
            hw: vector(&[None, None]),
        };
        let report = RunReport::build(&config, &RunSamples::RoundTrip { tx, rx });
        assert_eq!(report.packets, 1);
        assert_eq!(report.direction_mismatch, Some(DirectionMismatch { rx: 1, tx: 2 }));

        let rtt = report.round_trip.as_ref().unwrap();
        assert_eq!(rtt.tx_basis, Basis::Application);
        assert_eq!(rtt.rx_basis, Basis::Application);
        assert_eq!(rtt.section.values.count(), 1);
        assert!(report.to_string().contains("based on tx app and rx app"));
    }

    #[test]
    fn test_receive_rate_report_is_json() {
        let config = RunConfig::receive_rate(PacketType::Udp)
            .with_port(5000)
            .with_packet_count(11)
            .validate()
            .unwrap();
        let samples = RunSamples::ReceiveRate {
            received: 11,
            first: Some(Timestamp::from_nanos(0)),
            last: Some(Timestamp::from_nanos(10_000_000)),
            payload_len: Some(83),
        };
        let report = RunReport::build(&config, &samples);
        assert!(report.tx_sections.is_empty() && report.rx_sections.is_empty());
        let rate = report.rate.unwrap();
        assert!((rate.pps - 1000.0).abs() < 1e-6);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["packets"], 11);
        assert_eq!(json["frame_size"], 125);
        assert_eq!(json["mode"], "ReceiveRate");
    }
}
