//! rplget - packet latency measurement
//!
//! This library measures one-way and round-trip latency, jitter and rate of
//! network packets across several transports, including a kernel-bypass
//! AF_XDP path. Each stage a packet passes (application, kernel software
//! stamp, packet scheduler hops, NIC hardware stamp) is captured per packet,
//! and the statistics engine turns those captures into latency breakdowns.
//!
//! # Features
//!
//! - UDP, AF_PACKET (datagram and raw) and AF_XDP transports
//! - PTP and AVTP payloads, PTP multicast defaults
//! - `SO_TIMESTAMPING` software, hardware and scheduler captures
//! - Six run modes: generate, tx/rx latency, echo, round trip, rx rate
//! - Text and JSON reports
//!
//! # Example
//!
//! ```no_run
//! use rplget::bpf;
//! use rplget::config::{PacketType, RunConfig};
//! use rplget::driver::RunContext;
//! use rplget::report::RunReport;
//!
//! # fn main() -> rplget::Result<()> {
//! let config = RunConfig::transmit_latency(PacketType::PtpL4)
//!     .with_interface("eth0")
//!     .with_packet_count(1000)
//!     .validate()?;
//!
//! let loader = bpf::default_loader();
//! let mut ctx = RunContext::open(config.clone(), loader.as_ref())?;
//! let samples = ctx.run()?;
//! println!("{}", RunReport::build(&config, &samples));
//! # Ok(())
//! # }
//! ```

pub mod bpf;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod flags;
pub mod pacer;
pub mod packet;
pub mod progress;
pub mod report;
pub mod ring;
pub mod stats;
pub mod timestamp;
pub mod transport;
pub mod umem;
pub mod xsk;

pub use config::{Mode, PacketType, RunConfig};
pub use driver::{RunContext, RunSamples};
pub use error::{Error, Result};
pub use report::RunReport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
