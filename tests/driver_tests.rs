// Mode driver tests against a scripted transport
// No sockets are opened; the transport replays a queue of receive events

use rplget::config::{Address, PacketType, PayloadKind, RunConfig, TransportKind};
use rplget::driver::{RunContext, RunSamples, RunState};
use rplget::packet::{sequence_of, PayloadBuilder};
use rplget::timestamp::Timestamp;
use rplget::transport::{CaptureStamps, Received, Transport, TxStamps};
use rplget::{Error, Mode, Result, RunReport};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Event {
    Packet(Vec<u8>, CaptureStamps),
    Nothing,
    Fail,
}

#[derive(Default)]
struct Shared {
    sent: Vec<Vec<u8>>,
    replies: usize,
    closed: bool,
}

/// Transport whose receive side follows a script and whose send side records
/// what the driver handed it.
struct ScriptedTransport {
    script: VecDeque<Event>,
    shared: Arc<Mutex<Shared>>,
    current: Vec<u8>,
    /// Queue a stale packet and then the real echo for every send
    echo: bool,
    /// Sends with these indices fail for that packet only
    failing_sends: Vec<usize>,
    fatal_send: bool,
    tx_stamps: TxStamps,
}

impl ScriptedTransport {
    fn new(shared: Arc<Mutex<Shared>>) -> Self {
        Self {
            script: VecDeque::new(),
            shared,
            current: Vec::new(),
            echo: false,
            failing_sends: Vec::new(),
            fatal_send: false,
            tx_stamps: TxStamps::default(),
        }
    }

    fn with_script(mut self, events: Vec<Event>) -> Self {
        self.script = events.into();
        self
    }
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn send(&mut self, payload: &[u8]) -> Result<usize> {
        if self.fatal_send {
            return Err(Error::Resource("device gone".into()));
        }

        let mut shared = self.shared.lock().unwrap();
        let index = shared.sent.len();
        shared.sent.push(payload.to_vec());
        if self.failing_sends.contains(&index) {
            return Err(Error::Sample("short write".into()));
        }

        if self.echo {
            let stale = index
                .checked_sub(1)
                .map(|prev| shared.sent[prev].clone())
                .unwrap_or_else(|| vec![0u8; payload.len()]);
            self.script
                .push_back(Event::Packet(stale, CaptureStamps::default()));
            self.script.push_back(Event::Packet(
                payload.to_vec(),
                CaptureStamps {
                    software: Some(Timestamp::now()),
                    hardware: None,
                },
            ));
        }
        Ok(payload.len())
    }

    fn receive(&mut self) -> Result<Option<Received<'_>>> {
        match self.script.pop_front() {
            Some(Event::Packet(bytes, stamps)) => {
                self.current = bytes;
                Ok(Some(Received {
                    payload: &self.current,
                    stamps,
                }))
            }
            Some(Event::Fail) => Err(Error::Sample("truncated".into())),
            Some(Event::Nothing) | None => {
                std::thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
        }
    }

    fn reply(&mut self) -> Result<usize> {
        self.shared.lock().unwrap().replies += 1;
        Ok(self.current.len())
    }

    fn tx_timestamps(&mut self) -> Result<TxStamps> {
        Ok(self.tx_stamps.clone())
    }

    fn close(&mut self) -> Result<()> {
        self.shared.lock().unwrap().closed = true;
        Ok(())
    }
}

fn udp_packet(seq: u64) -> Vec<u8> {
    let mut builder = PayloadBuilder::new(PayloadKind::Plain, 32, 0);
    builder.build(seq).to_vec()
}

fn stamped(seq: u64, sw_ns: i64, hw_ns: i64) -> Event {
    Event::Packet(
        udp_packet(seq),
        CaptureStamps {
            software: Some(Timestamp::from_nanos(sw_ns)),
            hardware: Some(Timestamp::from_nanos(hw_ns)),
        },
    )
}

fn peer() -> Address {
    Address::Ip("10.0.0.2".parse().unwrap())
}

#[test]
fn test_generate_sends_sequenced_packets() {
    let config = RunConfig::generate(PacketType::Udp)
        .with_address(peer())
        .with_port(9000)
        .with_packet_count(5)
        .validate()
        .unwrap();
    let frame_size = config.frame_size.unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let mut ctx = RunContext::new(config, Box::new(ScriptedTransport::new(shared.clone())));

    let samples = ctx.run().unwrap();
    assert_eq!(ctx.state(), RunState::Done);
    assert_eq!(ctx.counter().load(Ordering::Relaxed), 5);

    match samples {
        RunSamples::Generate { sent, first, last } => {
            assert_eq!(sent, 5);
            assert!(first.unwrap() <= last.unwrap());
        }
        other => panic!("unexpected samples {:?}", other),
    }

    let shared = shared.lock().unwrap();
    let seqs: Vec<_> = shared
        .sent
        .iter()
        .map(|p| sequence_of(PayloadKind::Plain, p))
        .collect();
    assert_eq!(seqs, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    // frame size minus UDP/IP/Ethernet headers
    assert_eq!(shared.sent[0].len(), frame_size - 42);
}

#[test]
fn test_transmit_latency_keeps_vectors_aligned() {
    let config = RunConfig::transmit_latency(PacketType::Udp)
        .with_address(peer())
        .with_port(9000)
        .with_packet_count(4)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let mut transport = ScriptedTransport::new(shared.clone());
    transport.failing_sends = vec![2];
    transport.tx_stamps = TxStamps {
        software: Some(Timestamp::from_nanos(1_000)),
        hardware: Some(Timestamp::from_nanos(3_000)),
        sched: Vec::new(),
    };

    let mut ctx = RunContext::new(config, Box::new(transport));
    let samples = ctx.run().unwrap();

    let RunSamples::TransmitLatency { tx } = samples else {
        panic!("wrong samples variant");
    };
    assert_eq!(tx.app.len(), 4);
    assert_eq!(tx.sw.len(), 4);
    assert_eq!(tx.hw.len(), 4);
    assert_eq!(tx.app.valid_count(), 3);
    assert!(tx.app.get(2).is_none());
    assert!(tx.hw.get(2).is_none());
    assert_eq!(tx.hw.get(3), Some(Timestamp::from_nanos(3_000)));
}

#[test]
fn test_receive_latency_records_failures_in_place() {
    let config = RunConfig::receive_latency(PacketType::Udp)
        .with_port(9000)
        .with_packet_count(4)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let transport = ScriptedTransport::new(shared).with_script(vec![
        stamped(0, 100, 90),
        Event::Fail,
        Event::Nothing,
        stamped(2, 300, 290),
        stamped(3, 400, 390),
    ]);

    let mut ctx = RunContext::new(config.clone(), Box::new(transport));
    let samples = ctx.run().unwrap();

    let RunSamples::ReceiveLatency { rx, payload_len } = &samples else {
        panic!("wrong samples variant");
    };
    assert_eq!(rx.app.len(), 4);
    assert_eq!(rx.hw.valid_count(), 3);
    assert!(rx.sw.get(1).is_none());
    assert_eq!(rx.sw.get(3), Some(Timestamp::from_nanos(400)));
    assert_eq!(*payload_len, Some(32));

    let report = RunReport::build(&config, &samples);
    // counted on the hardware stamps, the failed receive has none
    assert_eq!(report.packets, 3);
    assert_eq!(report.frame_size, Some(32 + 42));
}

#[test]
fn test_echo_latency_replies_to_every_packet() {
    let config = RunConfig::echo_latency(PacketType::Udp)
        .with_address(peer())
        .with_port(9000)
        .with_packet_count(3)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let transport = ScriptedTransport::new(shared.clone()).with_script(vec![
        stamped(0, 100, 90),
        stamped(1, 200, 190),
        stamped(2, 300, 290),
    ]);

    let mut ctx = RunContext::new(config, Box::new(transport));
    let samples = ctx.run().unwrap();

    let RunSamples::EchoLatency { rx, tx, .. } = samples else {
        panic!("wrong samples variant");
    };
    assert_eq!(rx.app.len(), 3);
    assert_eq!(tx.app.len(), 3);
    assert_eq!(shared.lock().unwrap().replies, 3);
}

#[test]
fn test_round_trip_skips_stale_echoes() {
    let config = RunConfig::round_trip(PacketType::Udp)
        .with_address(peer())
        .with_port(9000)
        .with_packet_count(3)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let mut transport = ScriptedTransport::new(shared);
    transport.echo = true;

    let mut ctx = RunContext::new(config.clone(), Box::new(transport));
    let samples = ctx.run().unwrap();

    let RunSamples::RoundTrip { tx, rx } = &samples else {
        panic!("wrong samples variant");
    };
    assert_eq!(tx.app.len(), 3);
    assert_eq!(rx.app.len(), 3);
    assert_eq!(rx.app.valid_count(), 3);
    // the matching echo carries a software stamp, the stale one does not
    assert_eq!(rx.sw.valid_count(), 3);

    let report = RunReport::build(&config, &samples);
    assert!(report.round_trip.is_some());
    assert!(report.direction_mismatch.is_none());
}

#[test]
fn test_round_trip_times_out_missing_echo() {
    let config = RunConfig::round_trip(PacketType::Udp)
        .with_address(peer())
        .with_port(9000)
        .with_packet_count(1)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let mut ctx = RunContext::new(config, Box::new(ScriptedTransport::new(shared)));

    let samples = ctx.run().unwrap();
    let RunSamples::RoundTrip { tx, rx } = samples else {
        panic!("wrong samples variant");
    };
    assert_eq!(tx.app.valid_count(), 1);
    assert_eq!(rx.app.len(), 1);
    assert_eq!(rx.app.valid_count(), 0);
}

#[test]
fn test_receive_rate_counts_only_packets() {
    let config = RunConfig::receive_rate(PacketType::Udp)
        .with_port(9000)
        .with_packet_count(3)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let transport = ScriptedTransport::new(shared).with_script(vec![
        stamped(0, 0, 0),
        Event::Fail,
        stamped(1, 0, 0),
        Event::Nothing,
        stamped(2, 0, 0),
    ]);

    let mut ctx = RunContext::new(config, Box::new(transport));
    match ctx.run().unwrap() {
        RunSamples::ReceiveRate {
            received,
            first,
            last,
            payload_len,
        } => {
            assert_eq!(received, 3);
            assert!(first.is_some() && last.is_some());
            assert_eq!(payload_len, Some(32));
        }
        other => panic!("unexpected samples {:?}", other),
    }
}

#[test]
fn test_cancelled_run_stops_early() {
    let config = RunConfig::generate(PacketType::Udp)
        .with_address(peer())
        .with_port(9000)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let mut ctx = RunContext::new(config, Box::new(ScriptedTransport::new(shared)));

    ctx.cancellation_token().cancel();
    let samples = ctx.run().unwrap();
    assert_eq!(samples.mode(), Mode::Generate);
    assert_eq!(samples.packets(), 0);
}

#[test]
fn test_fatal_send_aborts_run() {
    let config = RunConfig::transmit_latency(PacketType::Udp)
        .with_address(peer())
        .with_port(9000)
        .with_packet_count(10)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let mut transport = ScriptedTransport::new(shared);
    transport.fatal_send = true;

    let mut ctx = RunContext::new(config, Box::new(transport));
    assert!(matches!(ctx.run(), Err(Error::Resource(_))));
    assert_eq!(ctx.state(), RunState::Done);
}

#[test]
fn test_context_runs_once_and_closes_on_drop() {
    let config = RunConfig::generate(PacketType::Udp)
        .with_address(peer())
        .with_port(9000)
        .with_packet_count(1)
        .validate()
        .unwrap();
    let shared = Arc::new(Mutex::new(Shared::default()));
    let mut ctx = RunContext::new(config, Box::new(ScriptedTransport::new(shared.clone())));

    ctx.run().unwrap();
    assert!(matches!(ctx.run(), Err(Error::Config(_))));
    assert!(!shared.lock().unwrap().closed);

    drop(ctx);
    assert!(shared.lock().unwrap().closed);
}
