use crate::flags::{Flag, FlagSet};
use crate::packet;
use crate::timestamp::{Timestamp, NSEC_PER_SEC};
use crate::{Error, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;
pub const PTP_PRIMARY_MCAST_IPADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);
pub const PTP_PRIMARY_MCAST_MACADDR: MacAddr = MacAddr([0x01, 0x1b, 0x19, 0x00, 0x00, 0x00]);
pub const PTP_FILTERED_MCAST_MACADDR: MacAddr = MacAddr([0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e]);

/// Highest stream id; the id is carried in the top two bits of the PTP sequence id.
pub const MAX_STREAM_ID: u8 = 3;

/// Run mode.
///
/// Selects which loop the mode driver runs and which timestamp vectors it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Paced sending only (`pkt-gen`)
    Generate,
    /// Paced sending with tx timestamp capture (`tx-lat`)
    TransmitLatency,
    /// Receiving with rx timestamp capture (`rx-lat`)
    ReceiveLatency,
    /// Receive every packet and echo it back (`echo-lat`)
    EchoLatency,
    /// Paced send, then wait for the echoed packet (`rtt`)
    RoundTrip,
    /// Receiving, counting only (`rx-rate`)
    ReceiveRate,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Generate => "pkt-gen",
            Mode::TransmitLatency => "tx-lat",
            Mode::ReceiveLatency => "rx-lat",
            Mode::EchoLatency => "echo-lat",
            Mode::RoundTrip => "rtt",
            Mode::ReceiveRate => "rx-rate",
        }
    }

    /// Modes that never originate packets.
    pub fn is_receive_only(&self) -> bool {
        matches!(self, Mode::ReceiveLatency | Mode::ReceiveRate)
    }

    /// Modes whose report is a latency breakdown.
    pub fn is_latency(&self) -> bool {
        matches!(
            self,
            Mode::TransmitLatency | Mode::ReceiveLatency | Mode::EchoLatency | Mode::RoundTrip
        )
    }

    /// Modes where the frame size comes from what was received.
    pub fn derives_frame_size(&self) -> bool {
        matches!(
            self,
            Mode::ReceiveLatency | Mode::EchoLatency | Mode::ReceiveRate
        )
    }

    /// Modes that send to a configured destination.
    pub fn originates(&self) -> bool {
        matches!(
            self,
            Mode::Generate | Mode::TransmitLatency | Mode::RoundTrip
        )
    }

    pub fn captures_tx(&self) -> bool {
        matches!(
            self,
            Mode::TransmitLatency | Mode::EchoLatency | Mode::RoundTrip
        )
    }

    pub fn captures_rx(&self) -> bool {
        matches!(
            self,
            Mode::ReceiveLatency | Mode::EchoLatency | Mode::RoundTrip
        )
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pkt-gen" => Ok(Mode::Generate),
            "tx-lat" => Ok(Mode::TransmitLatency),
            "rx-lat" => Ok(Mode::ReceiveLatency),
            "echo-lat" => Ok(Mode::EchoLatency),
            "rtt" => Ok(Mode::RoundTrip),
            "rx-rate" => Ok(Mode::ReceiveRate),
            other => Err(Error::Parse(format!("unknown mode \"{}\"", other))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The socket family used to move packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// UDP over IPv4
    Datagram,
    /// AF_PACKET / SOCK_DGRAM, the kernel builds the Ethernet header
    LinkLayer,
    /// AF_PACKET / SOCK_RAW, full frames
    Raw,
    /// AF_XDP rings and frame pool
    ZeroCopy,
}

/// What the payload of each packet looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    Plain,
    Ptp,
    Avtp,
}

/// Packet type as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    Udp,
    Avtp,
    PtpL2,
    PtpL4,
    XdpPtpL2,
    RawPtpL2,
}

impl PacketType {
    pub fn name(&self) -> &'static str {
        match self {
            PacketType::Udp => "udp",
            PacketType::Avtp => "avtp",
            PacketType::PtpL2 => "ptpl2",
            PacketType::PtpL4 => "ptpl4",
            PacketType::XdpPtpL2 => "xdp_ptpl2",
            PacketType::RawPtpL2 => "raw_ptpl2",
        }
    }

    pub fn transport(&self) -> TransportKind {
        match self {
            PacketType::Udp | PacketType::PtpL4 => TransportKind::Datagram,
            PacketType::Avtp | PacketType::PtpL2 => TransportKind::LinkLayer,
            PacketType::XdpPtpL2 => TransportKind::ZeroCopy,
            PacketType::RawPtpL2 => TransportKind::Raw,
        }
    }

    pub fn payload(&self) -> PayloadKind {
        match self {
            PacketType::Udp => PayloadKind::Plain,
            PacketType::Avtp => PayloadKind::Avtp,
            _ => PayloadKind::Ptp,
        }
    }
}

impl FromStr for PacketType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "udp" => Ok(PacketType::Udp),
            "avtp" => Ok(PacketType::Avtp),
            "ptpl2" => Ok(PacketType::PtpL2),
            "ptpl4" => Ok(PacketType::PtpL4),
            "xdp_ptpl2" => Ok(PacketType::XdpPtpL2),
            "raw_ptpl2" => Ok(PacketType::RawPtpL2),
            other => Err(Error::Parse(format!("unsupported packet type \"{}\"", other))),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::Parse(format!("invalid address \"{}\"", s)))?;
            if part.is_empty() || part.len() > 2 {
                return Err(Error::Parse(format!("invalid address \"{}\"", s)));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Parse(format!("invalid address \"{}\"", s)))?;
        }
        if parts.next().is_some() {
            return Err(Error::Parse(format!("invalid address \"{}\"", s)));
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Destination (or multicast group) address; its family follows the packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    Ip(Ipv4Addr),
    Mac(MacAddr),
}

impl Address {
    /// Parses `s` as the address family used by `packet_type`.
    pub fn parse_for(packet_type: PacketType, s: &str) -> Result<Self> {
        match packet_type.transport() {
            TransportKind::Datagram => s
                .parse::<Ipv4Addr>()
                .map(Address::Ip)
                .map_err(|_| Error::Parse(format!("invalid IPv4 address \"{}\"", s))),
            _ => s.parse::<MacAddr>().map(Address::Mac),
        }
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        match self {
            Address::Ip(ip) => Some(*ip),
            Address::Mac(_) => None,
        }
    }

    pub fn mac(&self) -> Option<MacAddr> {
        match self {
            Address::Mac(mac) => Some(*mac),
            Address::Ip(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Mac(mac) => write!(f, "{}", mac),
        }
    }
}

/// Report sections requested with `--format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Hardware timestamps relative to the first packet (or the rel-time override)
    Hwts,
    /// Inter-packet gaps
    Ipgap,
    /// One sample per line instead of min/max/mean
    Plain,
    /// Latency breakdowns
    Lat,
    /// Latencies up to and between packet scheduler hops
    Sched,
}

impl OutputFormat {
    /// Formats that produce report sections, as opposed to layout modifiers.
    pub fn is_printout(&self) -> bool {
        !matches!(self, OutputFormat::Plain)
    }
}

impl Flag for OutputFormat {
    const ALL: &'static [Self] = &[
        OutputFormat::Hwts,
        OutputFormat::Ipgap,
        OutputFormat::Plain,
        OutputFormat::Lat,
        OutputFormat::Sched,
    ];

    fn name(&self) -> &'static str {
        match self {
            OutputFormat::Hwts => "hwts",
            OutputFormat::Ipgap => "ipgap",
            OutputFormat::Plain => "plain",
            OutputFormat::Lat => "lat",
            OutputFormat::Sched => "sched",
        }
    }
}

/// Behavioural switches requested with `--option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOption {
    /// Do not request hardware timestamps
    DisableHwTimestamps,
    /// Log clock information before the run
    ClockCheck,
    /// Show a progress bar while measuring
    Progress,
    /// Poll for ingress packets instead of blocking
    SoftwarePoll,
}

impl Flag for RunOption {
    const ALL: &'static [Self] = &[
        RunOption::DisableHwTimestamps,
        RunOption::ClockCheck,
        RunOption::Progress,
        RunOption::SoftwarePoll,
    ];

    fn name(&self) -> &'static str {
        match self {
            RunOption::DisableHwTimestamps => "dis_hwts",
            RunOption::ClockCheck => "clock_check",
            RunOption::Progress => "progress",
            RunOption::SoftwarePoll => "sw_poll",
        }
    }
}

/// Parses a packets-per-second rate into the pacing interval.
///
/// Whole numbers use integer division, fractional rates (`"0.5"`) may yield
/// intervals longer than a second.
///
/// ```
/// use rplget::config::parse_pps;
/// use std::time::Duration;
///
/// assert_eq!(parse_pps("1000").unwrap(), Duration::from_nanos(1_000_000));
/// assert_eq!(parse_pps("0.5").unwrap(), Duration::from_secs(2));
/// ```
pub fn parse_pps(s: &str) -> Result<Duration> {
    let bad = || Error::Parse(format!("invalid packets per second \"{}\"", s));

    if s.contains('.') {
        let pps: f64 = s.parse().map_err(|_| bad())?;
        if !pps.is_finite() || pps <= 0.0 {
            return Err(bad());
        }
        let period = 1.0 / pps;
        let secs = period.trunc();
        let nanos = ((period - secs) * NSEC_PER_SEC as f64).round() as u64;
        Ok(Duration::from_secs(secs as u64) + Duration::from_nanos(nanos))
    } else {
        let pps: u64 = s.parse().map_err(|_| bad())?;
        if pps == 0 {
            return Err(bad());
        }
        Ok(Duration::from_nanos(NSEC_PER_SEC as u64 / pps))
    }
}

/// Parses a relative-time override given in nanoseconds.
pub fn parse_relative_time(s: &str) -> Result<Timestamp> {
    let ns: u64 = s
        .parse()
        .map_err(|_| Error::Parse(format!("invalid relative time \"{}\"", s)))?;
    let ns = i64::try_from(ns)
        .map_err(|_| Error::Parse(format!("relative time out of range \"{}\"", s)))?;
    Ok(Timestamp::from_nanos(ns))
}

/// Configuration of one measurement run.
///
/// Build it with the constructor for the mode and the `with_*` methods, then
/// call [`RunConfig::validate`]. The mode driver only accepts validated
/// configurations; validation fills in derived defaults (PTP multicast
/// addresses, default report format, scheduler depth) and rejects
/// contradictory combinations before any socket is opened.
///
/// # Examples
///
/// ```
/// use rplget::config::{Address, PacketType, RunConfig};
/// use std::time::Duration;
///
/// let config = RunConfig::transmit_latency(PacketType::PtpL4)
///     .with_packet_count(100)
///     .with_interval(Duration::from_millis(1))
///     .validate()
///     .unwrap();
///
/// // PTP event port and multicast group are filled in
/// assert_eq!(config.port, Some(319));
/// assert_eq!(
///     config.address,
///     Some(Address::Ip("224.0.1.129".parse().unwrap()))
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run mode
    pub mode: Mode,

    /// Packet type, which also selects the transport
    pub packet_type: PacketType,

    /// Interface name (required for raw and zero-copy transports)
    pub interface: Option<String>,

    /// Destination address, or multicast group to join
    pub address: Option<Address>,

    /// UDP port
    pub port: Option<u16>,

    /// Total frame size in bytes, link header included
    pub frame_size: Option<usize>,

    /// Number of packets to send or receive
    pub packet_count: Option<u64>,

    /// Pacing interval between sends
    pub interval: Option<Duration>,

    /// SO_PRIORITY for the socket
    pub priority: Option<i32>,

    /// SO_BUSY_POLL time in microseconds
    pub busy_poll: Option<u32>,

    /// Baseline for `hwts` output instead of the first packet's timestamp
    pub relative_time: Option<Timestamp>,

    /// PTP stream id, 0 to 3
    pub stream_id: u8,

    /// NIC queue for the zero-copy socket
    pub queue: Option<u32>,

    /// Number of packet scheduler hops expected on the tx path
    pub dev_deep: u32,

    /// Request a zero-copy AF_XDP bind
    pub zero_copy: bool,

    /// Report sections
    pub formats: FlagSet<OutputFormat>,

    /// Behavioural switches
    pub options: FlagSet<RunOption>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new(Mode::TransmitLatency, PacketType::PtpL4)
    }
}

impl RunConfig {
    /// Creates a configuration for `mode` with no other settings.
    pub fn new(mode: Mode, packet_type: PacketType) -> Self {
        Self {
            mode,
            packet_type,
            interface: None,
            address: None,
            port: None,
            frame_size: None,
            packet_count: None,
            interval: None,
            priority: None,
            busy_poll: None,
            relative_time: None,
            stream_id: 0,
            queue: None,
            dev_deep: 0,
            zero_copy: false,
            formats: FlagSet::new(),
            options: FlagSet::new(),
        }
    }

    pub fn generate(packet_type: PacketType) -> Self {
        Self::new(Mode::Generate, packet_type)
    }

    pub fn transmit_latency(packet_type: PacketType) -> Self {
        Self::new(Mode::TransmitLatency, packet_type)
    }

    pub fn receive_latency(packet_type: PacketType) -> Self {
        Self::new(Mode::ReceiveLatency, packet_type)
    }

    pub fn echo_latency(packet_type: PacketType) -> Self {
        Self::new(Mode::EchoLatency, packet_type)
    }

    pub fn round_trip(packet_type: PacketType) -> Self {
        Self::new(Mode::RoundTrip, packet_type)
    }

    pub fn receive_rate(packet_type: PacketType) -> Self {
        Self::new(Mode::ReceiveRate, packet_type)
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_frame_size(mut self, size: usize) -> Self {
        self.frame_size = Some(size);
        self
    }

    pub fn with_packet_count(mut self, count: u64) -> Self {
        self.packet_count = Some(count);
        self
    }

    /// Sets the pacing interval between sends.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets SO_BUSY_POLL in microseconds.
    pub fn with_busy_poll(mut self, micros: u32) -> Self {
        self.busy_poll = Some(micros);
        self
    }

    pub fn with_relative_time(mut self, baseline: Timestamp) -> Self {
        self.relative_time = Some(baseline);
        self
    }

    /// Sets the stream id; range is checked by [`RunConfig::validate`].
    pub fn with_stream_id(mut self, id: u8) -> Self {
        self.stream_id = id;
        self
    }

    pub fn with_queue(mut self, queue: u32) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_dev_deep(mut self, hops: u32) -> Self {
        self.dev_deep = hops;
        self
    }

    pub fn with_zero_copy(mut self, zero_copy: bool) -> Self {
        self.zero_copy = zero_copy;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.formats.insert(format);
        if format == OutputFormat::Sched {
            self.formats.insert(OutputFormat::Lat);
        }
        self
    }

    pub fn with_formats(mut self, formats: FlagSet<OutputFormat>) -> Self {
        for format in formats.iter() {
            self = self.with_format(format);
        }
        self
    }

    pub fn with_option(mut self, option: RunOption) -> Self {
        self.options.insert(option);
        self
    }

    pub fn with_options(mut self, options: FlagSet<RunOption>) -> Self {
        for option in options.iter() {
            self.options.insert(option);
        }
        self
    }

    pub fn transport(&self) -> TransportKind {
        self.packet_type.transport()
    }

    /// PTP traffic either by packet type or by UDP port 319/320.
    pub fn is_ptp(&self) -> bool {
        self.packet_type.payload() == PayloadKind::Ptp
            || matches!(self.port, Some(PTP_EVENT_PORT) | Some(PTP_GENERAL_PORT))
    }

    pub fn has_format(&self, format: OutputFormat) -> bool {
        self.formats.contains(format)
    }

    pub fn has_option(&self, option: RunOption) -> bool {
        self.options.contains(option)
    }

    /// Hardware timestamps are requested unless `dis_hwts` is set.
    pub fn wants_hw_timestamps(&self) -> bool {
        !self.has_option(RunOption::DisableHwTimestamps)
    }

    /// Checks the configuration and fills in derived defaults.
    ///
    /// Rejections are returned as [`Error::Config`]; adjustments are logged.
    pub fn validate(mut self) -> Result<Self> {
        let mode = self.mode;
        let kind = self.transport();

        if mode == Mode::ReceiveRate && self.options.remove(RunOption::Progress) {
            info!("Progress output is disabled in {} mode", mode);
        }

        match self.packet_count {
            None if mode != Mode::Generate => {
                return Err(Error::Config(
                    "packet num has to be given if not pkt-gen mode".into(),
                ))
            }
            Some(0) => {
                return Err(Error::Config(
                    "please provide countable packet number, but not 0".into(),
                ))
            }
            _ => {}
        }

        if self.stream_id > MAX_STREAM_ID {
            return Err(Error::Config(format!(
                "stream id has to be in range 0..={}, got {}",
                MAX_STREAM_ID, self.stream_id
            )));
        }

        if self.has_format(OutputFormat::Sched) {
            self.formats.insert(OutputFormat::Lat);
            if self.dev_deep == 0 {
                self.dev_deep = 1;
            }
        } else {
            self.dev_deep = 0;
        }

        if mode.is_latency() && !self.formats.any(|f| f.is_printout()) {
            self.formats.insert(OutputFormat::Lat);
        }

        if mode == Mode::ReceiveRate {
            let cleared = self.formats.remove_where(|f| f.is_printout());
            if !cleared.is_empty() {
                info!("Latencies or timestamps cannot be printed in this mode");
            }
        }

        if mode.is_receive_only() && self.interval.is_some() {
            return Err(Error::Config(format!("pps cannot be set in {} mode", mode)));
        }

        if mode.is_receive_only() && self.priority.is_some() {
            return Err(Error::Config("priority cannot be set in this mode".into()));
        }

        if mode.derives_frame_size() && self.frame_size.is_some() {
            return Err(Error::Config("packet size can't be set in this mode".into()));
        }

        let need_addr = match kind {
            TransportKind::Datagram => {
                if self.packet_type == PacketType::PtpL4 && self.port.is_none() {
                    self.port = Some(PTP_EVENT_PORT);
                }
                if self.port.is_none() {
                    return Err(Error::Config("Please, specify UDP port number".into()));
                }
                if self.address.is_none() && self.is_ptp() {
                    self.address = Some(Address::Ip(PTP_PRIMARY_MCAST_IPADDR));
                    info!("Destination address is set to {}", PTP_PRIMARY_MCAST_IPADDR);
                }
                self.address.is_none()
                    && matches!(
                        mode,
                        Mode::TransmitLatency | Mode::EchoLatency | Mode::RoundTrip | Mode::Generate
                    )
            }
            TransportKind::LinkLayer => {
                self.set_ptp_default_macaddr();
                if self.port.take().is_some() {
                    warn!("Cannot specify port for non UDP packets");
                }
                if self.interface.is_none() {
                    return Err(Error::Config(
                        "For L2 packets, dev has to be specified".into(),
                    ));
                }
                self.address.is_none() && mode.originates()
            }
            TransportKind::ZeroCopy => {
                if matches!(mode, Mode::ReceiveRate | Mode::Generate) {
                    return Err(Error::Config(
                        "Mode is not supported for af_xdp for now".into(),
                    ));
                }
                if self.port.is_some() {
                    return Err(Error::Config(
                        "UDP port is not supported for raw af_xdp sockets".into(),
                    ));
                }
                self.set_ptp_default_macaddr();
                if self.interface.is_none() {
                    return Err(Error::Config(
                        "For XDP sockets, dev has to be specified".into(),
                    ));
                }
                self.queue.get_or_insert(0);
                self.address.is_none() && mode.originates()
            }
            TransportKind::Raw => {
                self.set_ptp_default_macaddr();
                if self.interface.is_none() {
                    return Err(Error::Config(
                        "For RAW sockets, dev has to be specified".into(),
                    ));
                }
                self.address.is_none() && mode.originates()
            }
        };

        if need_addr {
            return Err(Error::Config("Please, specify the address".into()));
        }

        if let Some(address) = self.address {
            let matches_family = match kind {
                TransportKind::Datagram => address.ip().is_some(),
                _ => address.mac().is_some(),
            };
            if !matches_family {
                return Err(Error::Config(format!(
                    "address {} does not match packet type {}",
                    address, self.packet_type
                )));
            }
        }

        if !mode.derives_frame_size() {
            self.check_frame_size()?;
        }

        Ok(self)
    }

    fn set_ptp_default_macaddr(&mut self) {
        if self.address.is_some() || !self.is_ptp() {
            return;
        }

        if matches!(
            self.mode,
            Mode::TransmitLatency | Mode::Generate | Mode::RoundTrip | Mode::EchoLatency
        ) {
            self.address = Some(Address::Mac(PTP_PRIMARY_MCAST_MACADDR));
            info!(
                "Destination address set to {} (defaults: {} or {})",
                PTP_PRIMARY_MCAST_MACADDR, PTP_PRIMARY_MCAST_MACADDR, PTP_FILTERED_MCAST_MACADDR
            );
        } else {
            info!(
                "The interface address is used, a default can be specified: {} or {}",
                PTP_PRIMARY_MCAST_MACADDR, PTP_FILTERED_MCAST_MACADDR
            );
        }
    }

    fn check_frame_size(&mut self) -> Result<()> {
        let kind = self.transport();
        let min = packet::tx_overhead(kind) + packet::min_payload_len(self.packet_type.payload());
        let size = *self
            .frame_size
            .get_or_insert_with(|| min.max(packet::ETH_ZLEN));

        if size < min {
            return Err(Error::Config(format!(
                "frame size {} is below the {} bytes of headers for {}",
                size, min, self.packet_type
            )));
        }
        if size > packet::MAX_FRAME_SIZE {
            return Err(Error::Config(format!(
                "frame size {} exceeds {}",
                size,
                packet::MAX_FRAME_SIZE
            )));
        }
        if kind == TransportKind::ZeroCopy && size > crate::umem::DEFAULT_FRAME_SIZE as usize {
            return Err(Error::Config(format!(
                "frame size {} does not fit a {} byte umem frame",
                size,
                crate::umem::DEFAULT_FRAME_SIZE
            )));
        }
        Ok(())
    }
}
