//! Payload layouts and frame geometry.
//!
//! The mode driver builds the payload handed to the transport; the transport
//! (or the kernel) adds whatever sits below it. Three payloads exist:
//!
//! ```text
//! plain (UDP):  | magic "PLGT" (4) | sequence (8) | send time ns (8) | zero fill |
//! PTP:          | Sync message header (34) | originTimestamp (10) | zero fill |
//! AVTP:         | stream header (24) | zero fill |
//! ```
//!
//! For PTP the packet number is carried in `sequenceId`, whose two top bits
//! hold the stream id so that parallel streams can be told apart by NICs that
//! match on the sequence id.

use crate::config::{MacAddr, PayloadKind, TransportKind};
use crate::timestamp::Timestamp;

pub const ETH_ALEN: usize = 6;
pub const ETH_HLEN: usize = 14;
/// IPv4 header plus UDP header
pub const IP_UDP_HLEN: usize = 28;
/// Minimum Ethernet frame without FCS
pub const ETH_ZLEN: usize = 60;
/// Largest non-jumbo Ethernet frame without FCS
pub const MAX_FRAME_SIZE: usize = 1514;

pub const ETH_P_1588: u16 = 0x88f7;
pub const ETH_P_TSN: u16 = 0x22f0;

const PLAIN_MAGIC: u32 = 0x504c_4754; // "PLGT"
const PLAIN_HLEN: usize = 20;

const PTP_HLEN: usize = 34;
const PTP_SYNC_LEN: usize = 44;
const PTP_VERSION: u8 = 2;
const PTP_SEQ_OFFSET: usize = 30;
const PTP_STREAM_SHIFT: u16 = 14;
const PTP_SEQ_MASK: u16 = (1 << PTP_STREAM_SHIFT) - 1;

const AVTP_HLEN: usize = 24;
const AVTP_SUBTYPE_AAF: u8 = 0x02;
const AVTP_SV: u8 = 0x80;

/// Bytes the transport or kernel adds below the payload on transmit.
pub fn tx_overhead(kind: TransportKind) -> usize {
    match kind {
        TransportKind::Datagram => ETH_HLEN + IP_UDP_HLEN,
        TransportKind::LinkLayer | TransportKind::Raw | TransportKind::ZeroCopy => ETH_HLEN,
    }
}

/// Bytes of the wire frame that a receive call does not return.
///
/// Raw and zero-copy sockets see the whole frame.
pub fn rx_overhead(kind: TransportKind) -> usize {
    match kind {
        TransportKind::Datagram => ETH_HLEN + IP_UDP_HLEN,
        TransportKind::LinkLayer => ETH_HLEN,
        TransportKind::Raw | TransportKind::ZeroCopy => 0,
    }
}

/// Offset of our payload inside what a receive call returns.
pub fn payload_offset(kind: TransportKind) -> usize {
    match kind {
        TransportKind::Raw | TransportKind::ZeroCopy => ETH_HLEN,
        TransportKind::Datagram | TransportKind::LinkLayer => 0,
    }
}

/// Wire frame size implied by a received payload of `payload_len` bytes.
pub fn frame_size_from_rx(kind: TransportKind, payload_len: usize) -> usize {
    rx_overhead(kind) + payload_len
}

pub fn min_payload_len(kind: PayloadKind) -> usize {
    match kind {
        PayloadKind::Plain => PLAIN_HLEN,
        PayloadKind::Ptp => PTP_SYNC_LEN,
        PayloadKind::Avtp => AVTP_HLEN,
    }
}

pub fn ethertype(kind: PayloadKind) -> u16 {
    match kind {
        PayloadKind::Avtp => ETH_P_TSN,
        _ => ETH_P_1588,
    }
}

/// PTP `sequenceId` for packet `seq` of stream `stream_id`.
pub fn ptp_sequence_id(stream_id: u8, seq: u64) -> u16 {
    (u16::from(stream_id) << PTP_STREAM_SHIFT) | (seq as u16 & PTP_SEQ_MASK)
}

/// Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn to_bytes(&self) -> [u8; ETH_HLEN] {
        let mut bytes = [0u8; ETH_HLEN];
        bytes[0..6].copy_from_slice(&self.dst.octets());
        bytes[6..12].copy_from_slice(&self.src.octets());
        bytes[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ETH_HLEN {
            return None;
        }
        let mut dst = [0u8; ETH_ALEN];
        let mut src = [0u8; ETH_ALEN];
        dst.copy_from_slice(&bytes[0..6]);
        src.copy_from_slice(&bytes[6..12]);
        Some(Self {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ethertype: u16::from_be_bytes([bytes[12], bytes[13]]),
        })
    }
}

/// Swaps destination and source MAC of a frame in place, turning it around.
pub fn swap_mac(frame: &mut [u8]) -> bool {
    if frame.len() < ETH_HLEN {
        return false;
    }
    let (dst, rest) = frame.split_at_mut(ETH_ALEN);
    dst.swap_with_slice(&mut rest[..ETH_ALEN]);
    true
}

/// Reusable payload buffer for one run.
///
/// ```
/// use rplget::config::PayloadKind;
/// use rplget::packet::{sequence_of, PayloadBuilder};
///
/// let mut builder = PayloadBuilder::new(PayloadKind::Ptp, 60, 1);
/// let payload = builder.build(5);
/// assert_eq!(payload.len(), 60);
/// assert_eq!(sequence_of(PayloadKind::Ptp, payload), Some((1 << 14) | 5));
/// ```
pub struct PayloadBuilder {
    kind: PayloadKind,
    stream_id: u8,
    buf: Vec<u8>,
}

impl PayloadBuilder {
    /// `len` is clamped up to the payload's fixed header size.
    pub fn new(kind: PayloadKind, len: usize, stream_id: u8) -> Self {
        let len = len.max(min_payload_len(kind));
        let mut buf = vec![0u8; len];

        match kind {
            PayloadKind::Plain => {
                buf[0..4].copy_from_slice(&PLAIN_MAGIC.to_be_bytes());
            }
            PayloadKind::Ptp => {
                // messageType Sync, versionPTP 2
                buf[0] = 0x00;
                buf[1] = PTP_VERSION;
                buf[2..4].copy_from_slice(&(PTP_SYNC_LEN as u16).to_be_bytes());
                // logMessageInterval: unspecified
                buf[33] = 0x7f;
            }
            PayloadKind::Avtp => {
                buf[0] = AVTP_SUBTYPE_AAF;
                buf[1] = AVTP_SV;
                buf[11] = stream_id;
                let data_len = (len - AVTP_HLEN) as u16;
                buf[20..22].copy_from_slice(&data_len.to_be_bytes());
            }
        }

        Self {
            kind,
            stream_id,
            buf,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// What [`sequence_of`] reads back from the payload built for `seq`.
    pub fn sequence_tag(&self, seq: u64) -> u64 {
        match self.kind {
            PayloadKind::Plain => seq,
            PayloadKind::Ptp => u64::from(ptp_sequence_id(self.stream_id, seq)),
            PayloadKind::Avtp => seq & 0xff,
        }
    }

    /// Stamps packet number `seq` into the payload and returns it.
    pub fn build(&mut self, seq: u64) -> &[u8] {
        match self.kind {
            PayloadKind::Plain => {
                let now = Timestamp::now().as_nanos() as u64;
                self.buf[4..12].copy_from_slice(&seq.to_be_bytes());
                self.buf[12..20].copy_from_slice(&now.to_be_bytes());
            }
            PayloadKind::Ptp => {
                let id = ptp_sequence_id(self.stream_id, seq);
                self.buf[PTP_SEQ_OFFSET..PTP_SEQ_OFFSET + 2].copy_from_slice(&id.to_be_bytes());
            }
            PayloadKind::Avtp => {
                self.buf[2] = seq as u8;
            }
        }
        &self.buf
    }
}

/// Packet number carried by a payload, if it is one of ours.
pub fn sequence_of(kind: PayloadKind, payload: &[u8]) -> Option<u64> {
    match kind {
        PayloadKind::Plain => {
            if payload.len() < PLAIN_HLEN {
                return None;
            }
            let magic = u32::from_be_bytes(payload[0..4].try_into().ok()?);
            if magic != PLAIN_MAGIC {
                return None;
            }
            Some(u64::from_be_bytes(payload[4..12].try_into().ok()?))
        }
        PayloadKind::Ptp => {
            if payload.len() < PTP_HLEN || payload[1] & 0x0f != PTP_VERSION {
                return None;
            }
            let id = u16::from_be_bytes([payload[PTP_SEQ_OFFSET], payload[PTP_SEQ_OFFSET + 1]]);
            Some(u64::from(id))
        }
        PayloadKind::Avtp => {
            if payload.len() < AVTP_HLEN {
                return None;
            }
            Some(u64::from(payload[2]))
        }
    }
}
