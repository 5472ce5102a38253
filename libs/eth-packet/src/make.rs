//! Factory module for building Ethernet-framed test packets.

use etherparse::PacketBuilder;
use std::net::SocketAddrV4;

pub const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

#[derive(Debug, Default, Clone, Copy)]
pub struct SegFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl SegFlags {
    pub fn syn() -> Self {
        Self {
            syn: true,
            ..Default::default()
        }
    }

    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }

    pub fn rst() -> Self {
        Self {
            rst: true,
            ..Default::default()
        }
    }

    pub fn fin() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }
}

pub fn tcp_frame(src: SocketAddrV4, dst: SocketAddrV4, flags: SegFlags, payload: &[u8]) -> Vec<u8> {
    let mut packet = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4(src.ip().octets(), dst.ip().octets(), 64)
        .tcp(src.port(), dst.port(), 1, 64240);

    if flags.syn {
        packet = packet.syn();
    }
    if flags.ack {
        packet = packet.ack(1);
    }
    if flags.fin {
        packet = packet.fin();
    }
    if flags.rst {
        packet = packet.rst();
    }

    let mut buf = Vec::with_capacity(packet.size(payload.len()));
    packet
        .write(&mut buf, payload)
        .expect("writing to a Vec cannot fail");

    buf
}

pub fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let packet = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4(src.ip().octets(), dst.ip().octets(), 64)
        .udp(src.port(), dst.port());

    let mut buf = Vec::with_capacity(packet.size(payload.len()));
    packet
        .write(&mut buf, payload)
        .expect("writing to a Vec cannot fail");

    buf
}
