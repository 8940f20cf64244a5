//! Flow record model and wire codec
//!
//! A record describes one observed, one-sided flow. Only the source and
//! destination addresses, the direction bit, the link bitfield and the
//! first-seen timestamp drive the detector; the remaining fields ride
//! along and are forwarded untouched when a record is flagged.
//!
//! The wire form is a fixed 79-byte little-endian frame. Addresses occupy
//! 16 bytes each; IPv4 addresses are carried IPv4-mapped (`::ffff:a.b.c.d`)
//! so that the significant bytes sit in the last four bytes of the field.

use std::net::{IpAddr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpoofError};

/// Size of one encoded flow record.
pub const WIRE_SIZE: usize = 79;

/// Which way the flow was observed crossing the monitored boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Leaving the protected network.
    Outgoing,
    /// Entering the protected network.
    Incoming,
}

impl From<u8> for Direction {
    fn from(val: u8) -> Self {
        if val == 0 {
            Direction::Outgoing
        } else {
            Direction::Incoming
        }
    }
}

impl From<Direction> for u8 {
    fn from(val: Direction) -> Self {
        match val {
            Direction::Outgoing => 0,
            Direction::Incoming => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outgoing => write!(f, "out"),
            Direction::Incoming => write!(f, "in"),
        }
    }
}

/// One directional flow record.
///
/// Timestamps carry whole seconds in the high 32 bits; the low 32 bits are
/// sub-second fraction and are ignored by all window arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub direction: Direction,
    /// Bit per physical uplink that observed the flow.
    pub link_bitfield: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub packets: u64,
    pub bytes: u64,
    pub tcp_flags: u8,
}

impl FlowRecord {
    /// Convenience constructor used by the replay path and tests; the
    /// timestamp is given in whole seconds.
    pub fn new(
        src_addr: IpAddr,
        dst_addr: IpAddr,
        direction: Direction,
        link_bitfield: u64,
        first_secs: u64,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            direction,
            link_bitfield,
            first_seen: first_secs << 32,
            last_seen: first_secs << 32,
            packets: 0,
            bytes: 0,
            tcp_flags: 0,
        }
    }

    /// Whole-second portion of the first-seen timestamp.
    pub fn first_seen_secs(&self) -> u64 {
        self.first_seen >> 32
    }

    /// Decode one record from a fixed-size frame.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != WIRE_SIZE {
            return Err(SpoofError::RecordSize {
                expected: WIRE_SIZE,
                got: buf.len(),
            });
        }

        let mut addr = [0u8; 16];
        addr.copy_from_slice(&buf[0..16]);
        let src_addr = decode_addr(addr);
        addr.copy_from_slice(&buf[16..32]);
        let dst_addr = decode_addr(addr);

        Ok(Self {
            src_addr,
            dst_addr,
            src_port: u16::from_le_bytes([buf[32], buf[33]]),
            dst_port: u16::from_le_bytes([buf[34], buf[35]]),
            protocol: buf[36],
            direction: Direction::from(buf[37]),
            link_bitfield: read_u64(&buf[38..46]),
            first_seen: read_u64(&buf[46..54]),
            last_seen: read_u64(&buf[54..62]),
            packets: read_u64(&buf[62..70]),
            bytes: read_u64(&buf[70..78]),
            tcp_flags: buf[78],
        })
    }

    /// Encode into the fixed-size frame; the exact inverse of
    /// [`FlowRecord::from_bytes`], so flagged records are forwarded verbatim.
    pub fn to_bytes(&self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        buf[0..16].copy_from_slice(&encode_addr(self.src_addr));
        buf[16..32].copy_from_slice(&encode_addr(self.dst_addr));
        buf[32..34].copy_from_slice(&self.src_port.to_le_bytes());
        buf[34..36].copy_from_slice(&self.dst_port.to_le_bytes());
        buf[36] = self.protocol;
        buf[37] = u8::from(self.direction);
        buf[38..46].copy_from_slice(&self.link_bitfield.to_le_bytes());
        buf[46..54].copy_from_slice(&self.first_seen.to_le_bytes());
        buf[54..62].copy_from_slice(&self.last_seen.to_le_bytes());
        buf[62..70].copy_from_slice(&self.packets.to_le_bytes());
        buf[70..78].copy_from_slice(&self.bytes.to_le_bytes());
        buf[78] = self.tcp_flags;
        buf
    }
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(buf);
    u64::from_le_bytes(b)
}

fn decode_addr(bytes: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

fn encode_addr(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
