//! Zero-copy view over Ethernet-framed IPv4 TCP/UDP packets.
//!
//! [`EthFrame`] wraps the driver's mutable byte buffer and exposes exactly
//! the rewrites the hairpin datapath needs: MAC/IP swaps and port/source-IP
//! overwrites. All mutation happens in place; checksums are maintained
//! incrementally via [`checksum`], never recomputed from scratch.
//!
//! Parsing performs no allocation. Anything the datapath cannot handle
//! (IPv6, fragments, exotic protocols) is a typed [`ParseError`] so the
//! caller can let the packet through untouched.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod checksum;
pub mod make;

use std::net::Ipv4Addr;

/// Length of an Ethernet II header.
pub const ETH_HLEN: usize = 14;

const ETHERTYPE_IPV4: u16 = 0x0800;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Frame too short ({len} bytes)")]
    TooShort { len: usize },
    #[error("Not an IPv4 frame (ethertype {ethertype:#06x})")]
    NotIpv4 { ethertype: u16 },
    #[error("Invalid IPv4 header")]
    BadIpHeader,
    #[error("Fragmented packets are unsupported")]
    Fragmented,
    #[error("Unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("Transport header is truncated")]
    TruncatedTransport,
}

/// TCP flag byte (offset 13 of the TCP header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn syn(self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn rst(self) -> bool {
        self.0 & 0x04 != 0
    }

    pub fn ack(self) -> bool {
        self.0 & 0x10 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpFlags),
    Udp,
}

impl Transport {
    pub fn is_tcp(self) -> bool {
        matches!(self, Transport::Tcp(_))
    }
}

/// Stack-only summary of a parsed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktMeta {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,
}

/// A validated, mutable Ethernet+IPv4+TCP/UDP frame.
#[derive(Debug)]
pub struct EthFrame<'a> {
    buf: &'a mut [u8],
    /// Start of the transport header.
    tp: usize,
    transport: Transport,
}

impl<'a> EthFrame<'a> {
    pub fn parse(buf: &'a mut [u8]) -> Result<Self, ParseError> {
        let len = buf.len();

        if len < ETH_HLEN + 20 {
            return Err(ParseError::TooShort { len });
        }

        let ethertype = read_u16(buf, 12);
        if ethertype != ETHERTYPE_IPV4 {
            return Err(ParseError::NotIpv4 { ethertype });
        }

        let version_ihl = buf[ETH_HLEN];
        if version_ihl >> 4 != 4 {
            return Err(ParseError::BadIpHeader);
        }

        let ip_header_len = usize::from(version_ihl & 0x0F) * 4;
        if ip_header_len < 20 || ETH_HLEN + ip_header_len > len {
            return Err(ParseError::BadIpHeader);
        }

        // More-fragments or a non-zero fragment offset; either way the
        // transport header is not reliably ours to rewrite.
        let flags_frag = read_u16(buf, ETH_HLEN + 6);
        if flags_frag & 0x3FFF != 0 {
            return Err(ParseError::Fragmented);
        }

        let tp = ETH_HLEN + ip_header_len;
        let transport = match buf[ETH_HLEN + 9] {
            IPPROTO_TCP => {
                if tp + 20 > len {
                    return Err(ParseError::TruncatedTransport);
                }

                Transport::Tcp(TcpFlags(buf[tp + 13]))
            }
            IPPROTO_UDP => {
                if tp + 8 > len {
                    return Err(ParseError::TruncatedTransport);
                }

                Transport::Udp
            }
            other => return Err(ParseError::UnsupportedProtocol(other)),
        };

        Ok(Self { buf, tp, transport })
    }

    pub fn meta(&self) -> PktMeta {
        PktMeta {
            src_ip: self.src_ip(),
            dst_ip: self.dst_ip(),
            src_port: read_u16(self.buf, self.tp),
            dst_port: read_u16(self.buf, self.tp + 2),
            transport: self.transport,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        read_ip(self.buf, ETH_HLEN + 12)
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        read_ip(self.buf, ETH_HLEN + 16)
    }

    /// Swaps source and destination MAC addresses.
    pub fn swap_macs(&mut self) {
        let (dst, rest) = self.buf.split_at_mut(6);

        dst.swap_with_slice(&mut rest[..6]);
    }

    /// Swaps source and destination IP addresses.
    ///
    /// The one's-complement sum is commutative, so neither the IP header
    /// checksum nor the transport pseudo-header contribution changes.
    pub fn swap_ips(&mut self) {
        let (src, rest) = self.buf[ETH_HLEN + 12..].split_at_mut(4);

        src.swap_with_slice(&mut rest[..4]);
    }

    /// Overwrites the source IP, updating both checksums incrementally.
    pub fn set_src_ip(&mut self, ip: Ipv4Addr) {
        let old = u32::from(self.src_ip());
        let new = u32::from(ip);

        let stored = read_u16(self.buf, ETH_HLEN + 10);
        write_u16(
            self.buf,
            ETH_HLEN + 10,
            checksum::update_u32(stored, old, new),
        );

        self.update_transport_checksum(|c| checksum::update_u32(c, old, new));

        self.buf[ETH_HLEN + 12..ETH_HLEN + 16].copy_from_slice(&ip.octets());
    }

    pub fn set_src_port(&mut self, port: u16) {
        let old = read_u16(self.buf, self.tp);

        self.update_transport_checksum(|c| checksum::update_u16(c, old, port));
        write_u16(self.buf, self.tp, port);
    }

    pub fn set_dst_port(&mut self, port: u16) {
        let old = read_u16(self.buf, self.tp + 2);

        self.update_transport_checksum(|c| checksum::update_u16(c, old, port));
        write_u16(self.buf, self.tp + 2, port);
    }

    fn update_transport_checksum(&mut self, update: impl FnOnce(u16) -> u16) {
        let at = match self.transport {
            Transport::Tcp(_) => self.tp + 16,
            Transport::Udp => self.tp + 6,
        };

        let stored = read_u16(self.buf, at);

        // A zero UDP checksum means "no checksum"; it must stay zero.
        if stored == 0 && !self.transport.is_tcp() {
            return;
        }

        let mut new = update(stored);

        // RFC 768: a computed zero is transmitted as all-ones.
        if new == 0 && !self.transport.is_tcp() {
            new = 0xFFFF;
        }

        write_u16(self.buf, at, new);
    }
}

#[inline]
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn read_ip(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}
