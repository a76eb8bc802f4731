use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use pnet_packet::ethernet::EthernetPacket;
use pnet_packet::ip::IpNextHeaderProtocols;
use serde::Deserialize;

use crate::error::{Result, TapError};
use crate::frame::TaggedFrame;
use crate::parser::{handle_packet, Ieee80211Header, LinkType, PacketInfo, RadiotapHeader};
use crate::rules::RuleId;
use crate::stats::{CounterSnapshot, Counters, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct FilterId(pub u32);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol layer a filter inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    All,
    Radiotap,
    Mac,
    Ip,
    Udp,
    Tcp,
}

impl FromStr for Layer {
    type Err = TapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Layer::All),
            "radiotap" => Ok(Layer::Radiotap),
            "mac" | "80211" | "802.11" => Ok(Layer::Mac),
            "ip" => Ok(Layer::Ip),
            "udp" => Ok(Layer::Udp),
            "tcp" => Ok(Layer::Tcp),
            other => Err(TapError::invalid(format!("unknown filter type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// A filter's test, with its argument parsed once when the filter is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    All,
    SizeEqual(usize),
    SizeAtLeast(usize),
    SizeAtMost(usize),
    RadiotapHeader,
    RadiotapPresent(u32),
    MacSource([u8; 6]),
    MacDestination([u8; 6]),
    FrameControl(u16),
    IpSource(IpAddr),
    IpDestination(IpAddr),
    SourcePort(Transport, u16),
    DestinationPort(Transport, u16),
}

impl Predicate {
    pub fn parse(layer: Layer, subtype: &str, argument: &str) -> Result<Self> {
        let subtype = subtype.trim().to_ascii_lowercase();
        let arg = argument.trim();
        let predicate = match (layer, subtype.as_str()) {
            (Layer::All, "all") => Predicate::All,
            (Layer::All, "size-equal" | "size-eq") => Predicate::SizeEqual(parse_size(arg)?),
            (Layer::All, "size-greater-or-equal" | "size-ge") => Predicate::SizeAtLeast(parse_size(arg)?),
            (Layer::All, "size-less-or-equal" | "size-le") => Predicate::SizeAtMost(parse_size(arg)?),
            (Layer::Radiotap, "header") => Predicate::RadiotapHeader,
            (Layer::Radiotap, "present") => Predicate::RadiotapPresent(parse_bit(arg)?),
            (Layer::Mac, "source" | "sa") => Predicate::MacSource(parse_mac(arg)?),
            (Layer::Mac, "destination" | "da") => Predicate::MacDestination(parse_mac(arg)?),
            (Layer::Mac, "frame-control" | "fctl") => Predicate::FrameControl(parse_u16(arg)?),
            (Layer::Ip, "source") => Predicate::IpSource(parse_ip(arg)?),
            (Layer::Ip, "destination") => Predicate::IpDestination(parse_ip(arg)?),
            (Layer::Udp, "source-port") => Predicate::SourcePort(Transport::Udp, parse_u16(arg)?),
            (Layer::Udp, "destination-port") => Predicate::DestinationPort(Transport::Udp, parse_u16(arg)?),
            (Layer::Tcp, "source-port") => Predicate::SourcePort(Transport::Tcp, parse_u16(arg)?),
            (Layer::Tcp, "destination-port") => Predicate::DestinationPort(Transport::Tcp, parse_u16(arg)?),
            (layer, other) => {
                return Err(TapError::invalid(format!(
                    "unknown subtype '{}' for {:?} filter",
                    other, layer
                )));
            }
        };
        Ok(predicate)
    }

    /// Tests the captured frame (the bytes behind the metadata header).
    pub fn matches(&self, frame: &TaggedFrame) -> bool {
        let bytes = frame.frame();
        match *self {
            Predicate::All => true,
            Predicate::SizeEqual(n) => bytes.len() == n,
            Predicate::SizeAtLeast(n) => bytes.len() >= n,
            Predicate::SizeAtMost(n) => bytes.len() <= n,
            Predicate::RadiotapHeader => RadiotapHeader::parse(bytes).is_some(),
            Predicate::RadiotapPresent(bit) => RadiotapHeader::parse(bytes).is_some_and(|rt| rt.has_field(bit)),
            Predicate::MacSource(addr) => Ieee80211Header::locate(bytes)
                .and_then(|mac| mac.source())
                .is_some_and(|sa| sa == addr),
            Predicate::MacDestination(addr) => Ieee80211Header::locate(bytes)
                .and_then(|mac| mac.destination())
                .is_some_and(|da| da == addr),
            Predicate::FrameControl(fc) => Ieee80211Header::locate(bytes).is_some_and(|mac| mac.frame_control() == fc),
            Predicate::IpSource(ip) => ip_info(frame).is_some_and(|p| p.source_ip == ip),
            Predicate::IpDestination(ip) => ip_info(frame).is_some_and(|p| p.dest_ip == ip),
            Predicate::SourcePort(t, port) => ip_info(frame)
                .filter(|p| carries(p, t))
                .is_some_and(|p| p.source_port == Some(port)),
            Predicate::DestinationPort(t, port) => ip_info(frame)
                .filter(|p| carries(p, t))
                .is_some_and(|p| p.dest_port == Some(port)),
        }
    }
}

// IP-layer predicates only understand Ethernet captures.
fn ip_info(frame: &TaggedFrame) -> Option<PacketInfo> {
    if frame.link() != LinkType::Ethernet {
        return None;
    }
    EthernetPacket::new(frame.frame()).and_then(|eth| handle_packet(&eth))
}

fn carries(info: &PacketInfo, transport: Transport) -> bool {
    match transport {
        Transport::Udp => info.protocol == IpNextHeaderProtocols::Udp,
        Transport::Tcp => info.protocol == IpNextHeaderProtocols::Tcp,
    }
}

// `from_str_radix` takes a leading sign, so digits are checked first.
fn all_digits(s: &str, radix: u32) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_digit(radix))
}

fn parse_size(arg: &str) -> Result<usize> {
    let bad = || TapError::invalid(format!("bad frame size '{}'", arg));
    if !all_digits(arg, 10) {
        return Err(bad());
    }
    arg.parse().map_err(|_| bad())
}

fn parse_u16(arg: &str) -> Result<u16> {
    let bad = || TapError::invalid(format!("bad 16-bit value '{}'", arg));
    let (digits, radix) = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (arg, 10),
    };
    if !all_digits(digits, radix) {
        return Err(bad());
    }
    u16::from_str_radix(digits, radix).map_err(|_| bad())
}

fn parse_bit(arg: &str) -> Result<u32> {
    let bad = || TapError::invalid(format!("bad radiotap field bit '{}'", arg));
    if !all_digits(arg, 10) {
        return Err(bad());
    }
    arg.parse().map_err(|_| bad())
}

fn parse_mac(arg: &str) -> Result<[u8; 6]> {
    let bad = || TapError::invalid(format!("bad hardware address '{}'", arg));
    let mut addr = [0u8; 6];
    let mut parts = arg.split(':');
    for octet in addr.iter_mut() {
        let part = parts.next().ok_or_else(bad)?;
        if part.len() > 2 || !all_digits(part, 16) {
            return Err(bad());
        }
        *octet = u8::from_str_radix(part, 16).map_err(|_| bad())?;
    }
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok(addr)
}

fn parse_ip(arg: &str) -> Result<IpAddr> {
    arg.parse()
        .map_err(|_| TapError::invalid(format!("bad IP address '{}'", arg)))
}

/// A predicate bound to a rule, with its own tallies.
#[derive(Debug)]
pub struct Filter {
    pub id: FilterId,
    pub layer: Layer,
    pub predicate: Predicate,
    pub rule: RuleId,
    matches: AtomicU64,
    counters: Counters,
}

impl Filter {
    pub fn new(id: FilterId, layer: Layer, predicate: Predicate, rule: RuleId) -> Self {
        Filter {
            id,
            layer,
            predicate,
            rule,
            matches: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Builds a filter from its textual configuration.
    pub fn parse(id: FilterId, layer: &str, subtype: &str, rule: RuleId, argument: &str) -> Result<Self> {
        let layer: Layer = layer.parse()?;
        let predicate = Predicate::parse(layer, subtype, argument)?;
        Ok(Filter::new(id, layer, predicate, rule))
    }

    pub fn matches(&self, frame: &TaggedFrame) -> bool {
        self.predicate.matches(frame)
    }

    pub(crate) fn record_match(&self) {
        self.matches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, verdict: Verdict) {
        self.counters.record(verdict);
    }

    pub fn match_count(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn reset(&self) {
        self.matches.store(0, Ordering::Relaxed);
        self.counters.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tagged;
    use crate::parser::build;
    use std::net::Ipv4Addr;

    const BSSID: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    const BROADCAST: [u8; 6] = [0xff; 6];

    #[test]
    fn test_frame_control_filters_are_exact() {
        // ARRANGE
        let beacon = tagged(&build::wifi(0x0080, BROADCAST, BSSID), LinkType::Radiotap);
        let probe = tagged(&build::wifi(0x0040, BROADCAST, BSSID), LinkType::Radiotap);
        let beacons = Filter::parse(FilterId(1), "mac", "frame-control", RuleId(1), "0x0080").unwrap();
        let probes = Filter::parse(FilterId(2), "mac", "frame-control", RuleId(1), "0x0040").unwrap();

        // ACT / ASSERT
        assert!(beacons.matches(&beacon));
        assert!(!beacons.matches(&probe), "beacon filter must not take probe requests");
        assert!(probes.matches(&probe));
        assert!(!probes.matches(&beacon), "probe filter must not take beacons");
    }

    #[test]
    fn test_mac_address_filters() {
        let frame = tagged(&build::wifi(0x0080, BROADCAST, BSSID), LinkType::Radiotap);

        let by_source = Filter::parse(FilterId(1), "80211", "sa", RuleId(1), "00:11:22:33:44:55").unwrap();
        let by_dest = Filter::parse(FilterId(2), "mac", "destination", RuleId(1), "ff:ff:ff:ff:ff:ff").unwrap();
        let other = Filter::parse(FilterId(3), "mac", "source", RuleId(1), "00:11:22:33:44:56").unwrap();

        assert!(by_source.matches(&frame));
        assert!(by_dest.matches(&frame));
        assert!(!other.matches(&frame));
    }

    #[test]
    fn test_size_predicates() {
        let frame = tagged(&[0u8; 64], LinkType::Other(0));

        assert!(Predicate::parse(Layer::All, "size-equal", "64").unwrap().matches(&frame));
        assert!(!Predicate::parse(Layer::All, "size-equal", "65").unwrap().matches(&frame));
        assert!(Predicate::parse(Layer::All, "size-ge", "64").unwrap().matches(&frame));
        assert!(!Predicate::parse(Layer::All, "size-greater-or-equal", "65").unwrap().matches(&frame));
        assert!(Predicate::parse(Layer::All, "size-less-or-equal", "64").unwrap().matches(&frame));
        assert!(!Predicate::parse(Layer::All, "size-le", "63").unwrap().matches(&frame));
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        assert!(Filter::parse(FilterId(1), "ethernet", "all", RuleId(1), "").is_err(), "unknown layer");
        assert!(Filter::parse(FilterId(1), "mac", "bssid", RuleId(1), "").is_err(), "unknown subtype");
        assert!(Filter::parse(FilterId(1), "all", "size-eq", RuleId(1), "big").is_err());
        assert!(Filter::parse(FilterId(1), "mac", "sa", RuleId(1), "00:11:22:33:44").is_err());
        assert!(Filter::parse(FilterId(1), "mac", "sa", RuleId(1), "00:11:22:33:44:55:66").is_err());
        assert!(Filter::parse(FilterId(1), "mac", "fctl", RuleId(1), "0x1ffff").is_err());
        assert!(Filter::parse(FilterId(1), "ip", "source", RuleId(1), "300.1.1.1").is_err());
        assert!(
            Filter::parse(FilterId(1), "ip", "protocol", RuleId(1), "17").is_err(),
            "subtypes without an implementation are rejected up front"
        );
        assert!(Filter::parse(FilterId(1), "udp", "length", RuleId(1), "8").is_err());
    }

    #[test]
    fn test_signed_numbers_are_rejected() {
        // ARRANGE
        let cases = [
            ("mac", "sa", "+f:00:00:00:00:00"),
            ("mac", "da", "00:11:22:33:44:-5"),
            ("mac", "fctl", "0x+80"),
            ("mac", "fctl", "+128"),
            ("all", "size-eq", "+64"),
            ("udp", "destination-port", "+53"),
            ("radiotap", "present", "+1"),
        ];

        for (layer, subtype, argument) in cases {
            // ACT
            let result = Filter::parse(FilterId(1), layer, subtype, RuleId(1), argument);

            // ASSERT
            assert!(
                matches!(result, Err(TapError::InvalidArgument(_))),
                "{} {} '{}' must be rejected",
                layer,
                subtype,
                argument
            );
        }
    }

    #[test]
    fn test_hex_arguments_accept_either_case() {
        assert_eq!(
            Predicate::parse(Layer::Mac, "sa", "0A:bB:cc:DD:0e:F0").unwrap(),
            Predicate::MacSource([0x0a, 0xbb, 0xcc, 0xdd, 0x0e, 0xf0])
        );
        assert_eq!(
            Predicate::parse(Layer::Mac, "fctl", "0X00B0").unwrap(),
            Predicate::FrameControl(0x00b0)
        );
    }

    #[test]
    fn test_frame_control_accepts_decimal() {
        assert_eq!(
            Predicate::parse(Layer::Mac, "fctl", "128").unwrap(),
            Predicate::FrameControl(0x0080)
        );
    }

    #[test]
    fn test_radiotap_predicates() {
        let frame = tagged(&build::wifi(0x0080, BROADCAST, BSSID), LinkType::Radiotap);
        let garbage = tagged(&[7u8; 12], LinkType::Radiotap);

        assert!(Predicate::RadiotapHeader.matches(&frame));
        assert!(!Predicate::RadiotapHeader.matches(&garbage));
        assert!(!Predicate::RadiotapPresent(1).matches(&frame), "empty present bitmap");
    }

    #[test]
    fn test_mac_predicates_never_match_without_radiotap() {
        let frame = tagged(&[0x80, 0x00, 0, 0], LinkType::Radiotap);

        assert!(!Predicate::FrameControl(0x0080).matches(&frame));
    }

    #[test]
    fn test_ip_layer_only_on_ethernet() {
        // ARRANGE
        let src = Ipv4Addr::new(192, 168, 1, 50);
        let bytes = build::udp_over_ethernet(src, Ipv4Addr::new(8, 8, 8, 8), 10000, 53);
        let eth = tagged(&bytes, LinkType::Ethernet);
        let wifi = tagged(&bytes, LinkType::Radiotap);
        let by_source = Predicate::parse(Layer::Ip, "source", "192.168.1.50").unwrap();
        let dns = Predicate::parse(Layer::Udp, "destination-port", "53").unwrap();
        let tcp_dns = Predicate::parse(Layer::Tcp, "destination-port", "53").unwrap();

        // ACT / ASSERT
        assert!(by_source.matches(&eth));
        assert!(dns.matches(&eth));
        assert!(!tcp_dns.matches(&eth), "UDP packet must not satisfy a TCP port filter");
        assert!(!by_source.matches(&wifi), "IP filters never match non-Ethernet captures");
    }

    #[test]
    fn test_reset_keeps_filter() {
        let filter = Filter::parse(FilterId(1), "all", "all", RuleId(1), "").unwrap();
        filter.record_match();
        filter.record(Verdict::Dropped);

        filter.reset();

        assert_eq!(filter.match_count(), 0);
        assert_eq!(filter.counters(), CounterSnapshot::default());
        assert_eq!(filter.predicate, Predicate::All);
    }
}
