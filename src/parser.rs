use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet;
use std::net::IpAddr;

const DLT_EN10MB: i32 = 1;
const DLT_IEEE802_11_RADIO: i32 = 127;

/// Link-layer framing of a capture, as reported by the capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Radiotap header followed by an 802.11 MAC frame (monitor interfaces).
    Radiotap,
    Ethernet,
    Other(i32),
}

impl LinkType {
    pub fn from_datalink(dlt: i32) -> Self {
        match dlt {
            DLT_IEEE802_11_RADIO => LinkType::Radiotap,
            DLT_EN10MB => LinkType::Ethernet,
            other => LinkType::Other(other),
        }
    }
}

/// View over the radiotap header at the start of a monitor-mode capture.
#[derive(Debug, Clone, Copy)]
pub struct RadiotapHeader<'a> {
    buf: &'a [u8],
    length: usize,
}

#[allow(clippy::len_without_is_empty)]
impl<'a> RadiotapHeader<'a> {
    pub const MIN_LEN: usize = 8;

    /// Returns `None` unless the buffer starts with a version-0 radiotap
    /// header whose little-endian length fits inside the buffer.
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < Self::MIN_LEN || buf[0] != 0 {
            return None;
        }
        let length = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        if length < Self::MIN_LEN || length > buf.len() {
            return None;
        }
        Some(RadiotapHeader {
            buf: &buf[..length],
            length,
        })
    }

    /// Header length in bytes, never below `MIN_LEN`.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Iterates the present bitmap words. Bit 31 of a word announces another
    /// word; the chain stops early if it would run past the header.
    pub fn present_words(&self) -> impl Iterator<Item = u32> + 'a {
        let buf = self.buf;
        let mut offset = 4;
        let mut more = true;
        std::iter::from_fn(move || {
            if !more || offset + 4 > buf.len() {
                return None;
            }
            let word = u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
            more = word & (1 << 31) != 0;
            offset += 4;
            Some(word)
        })
    }

    pub fn has_field(&self, bit: u32) -> bool {
        let index = (bit / 32) as usize;
        self.present_words()
            .nth(index)
            .is_some_and(|word| word & (1 << (bit % 32)) != 0)
    }

    /// The bytes after the radiotap header (the 802.11 frame).
    pub fn payload(&self, frame: &'a [u8]) -> &'a [u8] {
        &frame[self.length.min(frame.len())..]
    }
}

/// The leading fields of an 802.11 MAC header.
#[derive(Debug, Clone, Copy)]
pub struct Ieee80211Header<'a> {
    buf: &'a [u8],
}

impl<'a> Ieee80211Header<'a> {
    /// Locates the MAC header right after the radiotap header of `frame`.
    pub fn locate(frame: &'a [u8]) -> Option<Self> {
        let radiotap = RadiotapHeader::parse(frame)?;
        let buf = radiotap.payload(frame);
        if buf.len() < 2 {
            return None;
        }
        Some(Ieee80211Header { buf })
    }

    /// Frame control as it appears on the air (little-endian), so a beacon
    /// reads `0x0080` and a probe request `0x0040`.
    pub fn frame_control(&self) -> u16 {
        u16::from_le_bytes([self.buf[0], self.buf[1]])
    }

    /// Address 1.
    pub fn destination(&self) -> Option<&'a [u8]> {
        self.buf.get(4..10)
    }

    /// Address 2.
    pub fn source(&self) -> Option<&'a [u8]> {
        self.buf.get(10..16)
    }
}

/// Addresses and ports extracted from an Ethernet-framed IP packet.
#[derive(Debug, PartialEq, Clone)]
pub struct PacketInfo {
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub source_port: Option<u16>,
    pub dest_port: Option<u16>,
    pub protocol: IpNextHeaderProtocol,
}

/// Parses an Ethernet frame carrying IPv4 or IPv6. Ports are filled in for
/// TCP and UDP; other transports leave them empty. Returns `None` for any
/// other ethertype or a malformed packet.
pub fn handle_packet(ethernet_packet: &EthernetPacket) -> Option<PacketInfo> {
    match ethernet_packet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ipv4 = Ipv4Packet::new(ethernet_packet.payload())?;
            Some(with_ports(
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                ipv4.get_next_level_protocol(),
                ipv4.payload(),
            ))
        }
        EtherTypes::Ipv6 => {
            let ipv6 = Ipv6Packet::new(ethernet_packet.payload())?;
            Some(with_ports(
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                ipv6.get_next_header(),
                ipv6.payload(),
            ))
        }
        _ => None,
    }
}

fn with_ports(source_ip: IpAddr, dest_ip: IpAddr, protocol: IpNextHeaderProtocol, payload: &[u8]) -> PacketInfo {
    let ports = if protocol == IpNextHeaderProtocols::Tcp {
        TcpPacket::new(payload).map(|tcp| (tcp.get_source(), tcp.get_destination()))
    } else if protocol == IpNextHeaderProtocols::Udp {
        UdpPacket::new(payload).map(|udp| (udp.get_source(), udp.get_destination()))
    } else {
        None
    };
    PacketInfo {
        source_ip,
        dest_ip,
        source_port: ports.map(|(s, _)| s),
        dest_port: ports.map(|(_, d)| d),
        protocol,
    }
}
