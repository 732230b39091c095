//! C1 — Packet Parser.
//!
//! Extracts a [`FiveTuple`] from a raw IPv4 datagram. No allocation, no
//! copying: every field is read directly out of the caller's buffer.
//! IPv6 and anything shorter than a minimal header is rejected here so
//! nothing downstream ever has to re-check it.

use std::net::Ipv4Addr;

use crate::error::ParseError;

/// Transport protocol as carried in the IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl Proto {
    fn from_ip_proto(byte: u8) -> Proto {
        match byte {
            1 => Proto::Icmp,
            6 => Proto::Tcp,
            17 => Proto::Udp,
            other => Proto::Other(other),
        }
    }

    fn has_ports(self) -> bool {
        matches!(self, Proto::Tcp | Proto::Udp)
    }
}

/// `(proto, src_addr, src_port, dst_addr, dst_port)`. Ports are zero for
/// protocols that don't carry them: `src_port = 0 iff proto ∉ {tcp,udp}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub proto: Proto,
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
}

/// Parses `buf` as an IPv4 datagram and extracts its five-tuple.
///
/// Unknown (non tcp/udp/icmp) protocols are not an error: the five-tuple
/// is still returned, with `src_port`/`dst_port` set to zero, so the
/// router can still classify the owner by address. Only structurally
/// invalid input is rejected.
pub fn parse(buf: &[u8]) -> Result<FiveTuple, ParseError> {
    if buf.len() < 20 {
        return Err(ParseError::TooShort);
    }

    let version = buf[0] >> 4;
    if version != 4 {
        return Err(ParseError::NotIPv4);
    }

    let header_len_words = buf[0] & 0x0f;
    let header_len = header_len_words as usize * 4;
    if !(5..=15).contains(&header_len_words) || header_len > buf.len() {
        return Err(ParseError::Malformed);
    }

    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if total_len > buf.len() {
        return Err(ParseError::Malformed);
    }

    let proto = Proto::from_ip_proto(buf[9]);
    let src_addr = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst_addr = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);

    let (src_port, dst_port) = if proto.has_ports() && buf.len() >= header_len + 4 {
        let p = &buf[header_len..header_len + 4];
        (
            u16::from_be_bytes([p[0], p[1]]),
            u16::from_be_bytes([p[2], p[3]]),
        )
    } else {
        (0, 0)
    };

    if matches!(proto, Proto::Other(_)) {
        return Ok(FiveTuple {
            proto,
            src_addr,
            src_port: 0,
            dst_addr,
            dst_port: 0,
        });
    }

    Ok(FiveTuple {
        proto,
        src_addr,
        src_port,
        dst_addr,
        dst_port,
    })
}
