//! The mode driver.
//!
//! A [`RunContext`] owns the transport for one run and walks
//! `Init -> Running -> Done` exactly once. Each mode has its own loop; all of
//! them append one entry per packet to every vector the mode keeps, so index
//! `i` of any vector always refers to packet `i`. Per-packet failures
//! ([`Error::is_sample`]) become invalid entries and the loop moves on;
//! anything else aborts the run.

use crate::bpf::XdpLoader;
use crate::config::{Mode, RunConfig, RunOption};
use crate::pacer::Pacer;
use crate::packet::{self, PayloadBuilder};
use crate::stats::{self, Basis};
use crate::timestamp::{Timestamp, TimestampVector};
use crate::transport::{self, CaptureStamps, Transport, TxStamps};
use crate::{clock, Error, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How long round-trip mode waits for the echo of one packet.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on vector pre-allocation; longer runs grow on demand.
const MAX_PREALLOC: u64 = 1 << 20;

/// Lifecycle of a [`RunContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Done,
}

/// Transmit-side captures, one entry per sent packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxVectors {
    pub app: TimestampVector,
    pub sw: TimestampVector,
    pub hw: TimestampVector,
    /// One vector per packet scheduler hop
    pub sched: Vec<TimestampVector>,
}

impl TxVectors {
    pub fn with_capacity(capacity: usize, sched_depth: usize) -> Self {
        Self {
            app: TimestampVector::with_capacity(capacity),
            sw: TimestampVector::with_capacity(capacity),
            hw: TimestampVector::with_capacity(capacity),
            sched: (0..sched_depth)
                .map(|_| TimestampVector::with_capacity(capacity))
                .collect(),
        }
    }

    pub fn record(&mut self, app: Timestamp, stamps: &TxStamps) {
        self.app.push(Some(app));
        self.sw.push(stamps.software);
        self.hw.push(stamps.hardware);
        for (i, hop) in self.sched.iter_mut().enumerate() {
            hop.push(stamps.sched.get(i).copied());
        }
    }

    pub fn record_failed(&mut self) {
        self.app.push(None);
        self.sw.push(None);
        self.hw.push(None);
        for hop in &mut self.sched {
            hop.push(None);
        }
    }

    pub fn len(&self) -> usize {
        self.app.len()
    }

    pub fn is_empty(&self) -> bool {
        self.app.is_empty()
    }

    pub fn best(&self) -> (Basis, &TimestampVector) {
        stats::best_available(&self.hw, &self.sw, &self.app)
    }
}

/// Receive-side captures, one entry per received packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RxVectors {
    pub app: TimestampVector,
    pub sw: TimestampVector,
    pub hw: TimestampVector,
}

impl RxVectors {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            app: TimestampVector::with_capacity(capacity),
            sw: TimestampVector::with_capacity(capacity),
            hw: TimestampVector::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, app: Timestamp, stamps: CaptureStamps) {
        self.app.push(Some(app));
        self.sw.push(stamps.software);
        self.hw.push(stamps.hardware);
    }

    pub fn record_failed(&mut self) {
        self.app.push(None);
        self.sw.push(None);
        self.hw.push(None);
    }

    pub fn len(&self) -> usize {
        self.app.len()
    }

    pub fn is_empty(&self) -> bool {
        self.app.is_empty()
    }

    pub fn best(&self) -> (Basis, &TimestampVector) {
        stats::best_available(&self.hw, &self.sw, &self.app)
    }
}

/// What a run collected. Each mode carries only its own vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunSamples {
    Generate {
        sent: u64,
        first: Option<Timestamp>,
        last: Option<Timestamp>,
    },
    TransmitLatency {
        tx: TxVectors,
    },
    ReceiveLatency {
        rx: RxVectors,
        /// Size of the last received payload
        payload_len: Option<usize>,
    },
    EchoLatency {
        rx: RxVectors,
        tx: TxVectors,
        payload_len: Option<usize>,
    },
    RoundTrip {
        tx: TxVectors,
        rx: RxVectors,
    },
    ReceiveRate {
        received: u64,
        first: Option<Timestamp>,
        last: Option<Timestamp>,
        payload_len: Option<usize>,
    },
}

impl RunSamples {
    pub fn mode(&self) -> Mode {
        match self {
            RunSamples::Generate { .. } => Mode::Generate,
            RunSamples::TransmitLatency { .. } => Mode::TransmitLatency,
            RunSamples::ReceiveLatency { .. } => Mode::ReceiveLatency,
            RunSamples::EchoLatency { .. } => Mode::EchoLatency,
            RunSamples::RoundTrip { .. } => Mode::RoundTrip,
            RunSamples::ReceiveRate { .. } => Mode::ReceiveRate,
        }
    }

    /// Iterations the run completed.
    pub fn packets(&self) -> u64 {
        match self {
            RunSamples::Generate { sent, .. } => *sent,
            RunSamples::TransmitLatency { tx } => tx.len() as u64,
            RunSamples::ReceiveLatency { rx, .. } => rx.len() as u64,
            RunSamples::EchoLatency { rx, .. } => rx.len() as u64,
            RunSamples::RoundTrip { tx, .. } => tx.len() as u64,
            RunSamples::ReceiveRate { received, .. } => *received,
        }
    }
}

struct Arrival {
    app: Timestamp,
    stamps: CaptureStamps,
    len: usize,
}

enum Wait {
    Packet(Arrival),
    /// The receive failed for this packet
    Failed,
    /// Cancelled or timed out
    Idle,
}

/// Everything one run owns.
///
/// The transport is closed when the context is dropped, whichever way the
/// run ended.
pub struct RunContext {
    config: RunConfig,
    transport: Box<dyn Transport>,
    counter: Arc<AtomicU64>,
    cancel: CancellationToken,
    state: RunState,
}

impl RunContext {
    /// Wraps an already opened transport. `config` must be validated.
    pub fn new(config: RunConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            counter: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            state: RunState::Init,
        }
    }

    /// Opens the transport the configuration asks for.
    pub fn open(config: RunConfig, loader: &dyn XdpLoader) -> Result<Self> {
        let transport = transport::open(&config, loader)?;
        Ok(Self::new(config, transport))
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Packets handled so far. Updated with relaxed ordering.
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.counter)
    }

    /// Cancelling the token ends the run after the current packet.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs the configured mode to completion.
    pub fn run(&mut self) -> Result<RunSamples> {
        if self.state != RunState::Init {
            return Err(Error::Config("a run context can only run once".into()));
        }

        if self.config.has_option(RunOption::ClockCheck) {
            clock::log_resolution();
            clock::sanity_check(libc::CLOCK_REALTIME)?;
        }

        self.state = RunState::Running;
        info!(
            "Starting {} over {} ({} packets)",
            self.config.mode,
            self.config.packet_type,
            self.config
                .packet_count
                .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
        );

        let result = match self.config.mode {
            Mode::Generate => self.generate(),
            Mode::TransmitLatency => self.transmit_latency(),
            Mode::ReceiveLatency => self.receive_latency(),
            Mode::EchoLatency => self.echo_latency(),
            Mode::RoundTrip => self.round_trip(),
            Mode::ReceiveRate => self.receive_rate(),
        };
        self.state = RunState::Done;

        if let Ok(samples) = &result {
            info!("Run finished after {} packets", samples.packets());
        }
        result
    }

    /// Closes the transport now, reporting failures.
    pub fn close(mut self) -> Result<()> {
        self.transport.close()
    }

    fn keep_going(&self, done: u64) -> bool {
        !self.cancel.is_cancelled() && self.config.packet_count.map_or(true, |n| done < n)
    }

    fn capacity(&self) -> usize {
        self.config.packet_count.unwrap_or(0).min(MAX_PREALLOC) as usize
    }

    fn sched_depth(&self) -> usize {
        self.config.dev_deep as usize
    }

    fn payload_builder(&self) -> PayloadBuilder {
        let kind = self.config.transport();
        let payload = self.config.packet_type.payload();
        let len = self
            .config
            .frame_size
            .map_or(0, |size| size.saturating_sub(packet::tx_overhead(kind)));
        PayloadBuilder::new(payload, len, self.config.stream_id)
    }

    fn tick(&self, done: u64) {
        self.counter.store(done, Ordering::Relaxed);
    }

    /// Sends packet `seq`. Returns the application send time, or `None` when
    /// the send failed for this packet only.
    fn send_one(
        &mut self,
        builder: &mut PayloadBuilder,
        seq: u64,
        pacer: &mut Pacer,
    ) -> Result<Option<Timestamp>> {
        let payload = builder.build(seq);
        let app = Timestamp::now();
        pacer.mark();
        match self.transport.send(payload) {
            Ok(_) => Ok(Some(app)),
            Err(e) if e.is_sample() => {
                debug!("Packet {} not sent: {}", seq, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn capture_tx(&mut self, tx: &mut TxVectors, app: Option<Timestamp>) -> Result<()> {
        let Some(app) = app else {
            tx.record_failed();
            return Ok(());
        };
        match self.transport.tx_timestamps() {
            Ok(stamps) => tx.record(app, &stamps),
            Err(e) if e.is_sample() => {
                debug!("No tx timestamps for packet {}: {}", tx.len(), e);
                tx.record(app, &TxStamps::default());
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Waits for the next packet, optionally only one carrying `expect` as
    /// its sequence tag, until `deadline` or cancellation.
    fn wait_packet(&mut self, deadline: Option<Instant>, expect: Option<u64>) -> Result<Wait> {
        let payload_kind = self.config.packet_type.payload();
        let offset = packet::payload_offset(self.config.transport());

        loop {
            if self.cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(Wait::Idle);
            }
            let received = match self.transport.receive() {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(e) if e.is_sample() => {
                    debug!("Receive failed: {}", e);
                    return Ok(Wait::Failed);
                }
                Err(e) => return Err(e),
            };
            let app = Timestamp::now();

            if let Some(want) = expect {
                let seq = received
                    .payload
                    .get(offset..)
                    .and_then(|p| packet::sequence_of(payload_kind, p));
                if seq != Some(want) {
                    debug!("Skipping stale packet {:?}, waiting for {}", seq, want);
                    continue;
                }
            }

            return Ok(Wait::Packet(Arrival {
                app,
                stamps: received.stamps,
                len: received.payload.len(),
            }));
        }
    }

    fn generate(&mut self) -> Result<RunSamples> {
        let mut builder = self.payload_builder();
        let mut pacer = Pacer::new(self.config.interval);
        let (mut first, mut last) = (None, None);
        let mut seq = 0;

        while self.keep_going(seq) {
            if let Some(app) = self.send_one(&mut builder, seq, &mut pacer)? {
                first.get_or_insert(app);
                last = Some(app);
            }
            seq += 1;
            self.tick(seq);
            pacer.wait();
        }

        Ok(RunSamples::Generate {
            sent: seq,
            first,
            last,
        })
    }

    fn transmit_latency(&mut self) -> Result<RunSamples> {
        let mut builder = self.payload_builder();
        let mut pacer = Pacer::new(self.config.interval);
        let mut tx = TxVectors::with_capacity(self.capacity(), self.sched_depth());
        let mut seq = 0;

        while self.keep_going(seq) {
            let app = self.send_one(&mut builder, seq, &mut pacer)?;
            self.capture_tx(&mut tx, app)?;
            seq += 1;
            self.tick(seq);
            if self.keep_going(seq) {
                pacer.wait();
            }
        }

        Ok(RunSamples::TransmitLatency { tx })
    }

    fn receive_latency(&mut self) -> Result<RunSamples> {
        let mut rx = RxVectors::with_capacity(self.capacity());
        let mut payload_len = None;
        let mut n = 0;

        while self.keep_going(n) {
            match self.wait_packet(None, None)? {
                Wait::Packet(arrival) => {
                    rx.record(arrival.app, arrival.stamps);
                    payload_len = Some(arrival.len);
                }
                Wait::Failed => rx.record_failed(),
                Wait::Idle => break,
            }
            n += 1;
            self.tick(n);
        }

        Ok(RunSamples::ReceiveLatency { rx, payload_len })
    }

    fn echo_latency(&mut self) -> Result<RunSamples> {
        let capacity = self.capacity();
        let mut rx = RxVectors::with_capacity(capacity);
        let mut tx = TxVectors::with_capacity(capacity, self.sched_depth());
        // echoes follow arrivals; an interval only enforces a minimum spacing
        let mut pacer = Pacer::new(self.config.interval);
        let mut payload_len = None;
        let mut n = 0;

        while self.keep_going(n) {
            match self.wait_packet(None, None)? {
                Wait::Packet(arrival) => {
                    rx.record(arrival.app, arrival.stamps);
                    payload_len = Some(arrival.len);

                    pacer.wait();
                    let app = Timestamp::now();
                    pacer.mark();
                    let sent = match self.transport.reply() {
                        Ok(_) => Some(app),
                        Err(e) if e.is_sample() => {
                            debug!("Echo of packet {} failed: {}", n, e);
                            None
                        }
                        Err(e) => return Err(e),
                    };
                    self.capture_tx(&mut tx, sent)?;
                }
                Wait::Failed => {
                    rx.record_failed();
                    tx.record_failed();
                }
                Wait::Idle => break,
            }
            n += 1;
            self.tick(n);
        }

        Ok(RunSamples::EchoLatency {
            rx,
            tx,
            payload_len,
        })
    }

    fn round_trip(&mut self) -> Result<RunSamples> {
        let capacity = self.capacity();
        let mut builder = self.payload_builder();
        let mut pacer = Pacer::new(self.config.interval);
        let mut tx = TxVectors::with_capacity(capacity, self.sched_depth());
        let mut rx = RxVectors::with_capacity(capacity);
        let mut seq = 0;

        while self.keep_going(seq) {
            let app = self.send_one(&mut builder, seq, &mut pacer)?;
            self.capture_tx(&mut tx, app)?;

            if app.is_some() {
                let deadline = Instant::now() + ECHO_TIMEOUT;
                match self.wait_packet(Some(deadline), Some(builder.sequence_tag(seq)))? {
                    Wait::Packet(arrival) => rx.record(arrival.app, arrival.stamps),
                    Wait::Failed | Wait::Idle => {
                        debug!("No echo for packet {}", seq);
                        rx.record_failed();
                    }
                }
            } else {
                rx.record_failed();
            }

            seq += 1;
            self.tick(seq);
            if self.keep_going(seq) {
                pacer.wait();
            }
        }

        Ok(RunSamples::RoundTrip { tx, rx })
    }

    fn receive_rate(&mut self) -> Result<RunSamples> {
        let (mut first, mut last) = (None, None);
        let mut payload_len = None;
        let mut received = 0;

        while self.keep_going(received) {
            match self.wait_packet(None, None)? {
                Wait::Packet(arrival) => {
                    first.get_or_insert(arrival.app);
                    last = Some(arrival.app);
                    payload_len = Some(arrival.len);
                    received += 1;
                    self.tick(received);
                }
                Wait::Failed => continue,
                Wait::Idle => break,
            }
        }

        Ok(RunSamples::ReceiveRate {
            received,
            first,
            last,
            payload_len,
        })
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if let Err(e) = self.transport.close() {
            warn!("Failed to close transport: {}", e);
        }
    }
}
