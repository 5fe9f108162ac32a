//! Network addressing: NIDs, network identifiers and driver types
//!
//! A NID is a 64-bit node address: the upper 32 bits name the network, the
//! lower 32 bits the address on that network. A network identifier is itself
//! split into the interface driver type (upper 16 bits) and the network
//! number (lower 16 bits), so `tcp1` and `tcp2` are two distinct networks
//! served by the same socket driver.
//!
//! Text form is `addr@net`, e.g. `10.0.0.1@tcp`, `12@gni1`, `0@lo`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Interface driver type carried in the upper half of a network identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LndType {
    /// Kernel socket driver (`tcp`)
    Socket,
    /// Portals driver (`ptl`), considered collectively when checking routers
    Ptl,
    /// InfiniBand verbs driver (`o2ib`)
    O2ib,
    /// Loopback driver (`lo`), never routed, always alive
    Loopback,
    /// Gemini driver (`gni`)
    Gni,
    /// Any other driver type
    Other(u16),
}

impl LndType {
    /// Numeric driver type as carried on the wire
    pub fn as_u16(&self) -> u16 {
        match self {
            LndType::Socket => 2,
            LndType::Ptl => 4,
            LndType::O2ib => 5,
            LndType::Loopback => 9,
            LndType::Gni => 13,
            LndType::Other(v) => *v,
        }
    }

    /// Convert from the numeric driver type
    pub fn from_u16(value: u16) -> Self {
        match value {
            2 => LndType::Socket,
            4 => LndType::Ptl,
            5 => LndType::O2ib,
            9 => LndType::Loopback,
            13 => LndType::Gni,
            other => LndType::Other(other),
        }
    }

    fn name(&self) -> Option<&'static str> {
        match self {
            LndType::Socket => Some("tcp"),
            LndType::Ptl => Some("ptl"),
            LndType::O2ib => Some("o2ib"),
            LndType::Loopback => Some("lo"),
            LndType::Gni => Some("gni"),
            LndType::Other(_) => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(LndType::Socket),
            "ptl" => Some(LndType::Ptl),
            "o2ib" => Some(LndType::O2ib),
            "lo" => Some(LndType::Loopback),
            "gni" => Some(LndType::Gni),
            _ => None,
        }
    }

    /// Drivers whose addresses are IPv4 addresses
    fn has_ip_addresses(&self) -> bool {
        matches!(self, LndType::Socket | LndType::O2ib)
    }
}

/// Errors from parsing NID / network text
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Missing '@' in NID: {0}")]
    MissingSeparator(String),
    #[error("Unknown network type: {0}")]
    UnknownNetwork(String),
    #[error("Invalid network number: {0}")]
    InvalidNumber(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

// ============================================================================
// NETWORK IDENTIFIER
// ============================================================================

/// 32-bit network identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetId(pub u32);

impl NetId {
    /// Wildcard network (the network part of [`Nid::ANY`])
    pub const ANY: NetId = NetId(u32::MAX);

    /// Build a network identifier from a driver type and network number
    pub fn new(lnd: LndType, number: u16) -> Self {
        NetId(((lnd.as_u16() as u32) << 16) | number as u32)
    }

    /// Driver type serving this network
    pub fn lnd(&self) -> LndType {
        LndType::from_u16((self.0 >> 16) as u16)
    }

    /// Network number within the driver type
    pub fn number(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn is_any(&self) -> bool {
        *self == NetId::ANY
    }

    pub fn is_loopback(&self) -> bool {
        self.lnd() == LndType::Loopback
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return write!(f, "<any>");
        }
        match self.lnd().name() {
            Some(name) if self.number() == 0 => write!(f, "{}", name),
            Some(name) => write!(f, "{}{}", name, self.number()),
            None => write!(f, "<{}:{}>", self.lnd().as_u16(), self.number()),
        }
    }
}

impl FromStr for NetId {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Driver names may contain digits ("o2ib"), so only trailing digits
        // form the network number.
        let name = s.trim_end_matches(|c: char| c.is_ascii_digit());
        let (name, number) = s.split_at(name.len());

        let lnd = LndType::from_name(name)
            .ok_or_else(|| AddressParseError::UnknownNetwork(s.to_string()))?;
        let number = if number.is_empty() {
            0
        } else {
            number
                .parse::<u16>()
                .map_err(|_| AddressParseError::InvalidNumber(s.to_string()))?
        };

        Ok(NetId::new(lnd, number))
    }
}

// ============================================================================
// NODE IDENTIFIER
// ============================================================================

/// 64-bit node identifier: network in the upper half, address in the lower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nid(pub u64);

impl Nid {
    /// Wildcard NID
    pub const ANY: Nid = Nid(u64::MAX);

    pub fn new(net: NetId, addr: u32) -> Self {
        Nid(((net.0 as u64) << 32) | addr as u64)
    }

    /// Network this NID lives on
    pub fn net(&self) -> NetId {
        NetId((self.0 >> 32) as u32)
    }

    /// Address within the network
    pub fn addr(&self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    pub fn is_any(&self) -> bool {
        *self == Nid::ANY
    }
}

impl fmt::Display for Nid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return write!(f, "<any>");
        }
        let net = self.net();
        if net.lnd().has_ip_addresses() {
            write!(f, "{}@{}", Ipv4Addr::from(self.addr()), net)
        } else {
            write!(f, "{}@{}", self.addr(), net)
        }
    }
}

impl FromStr for Nid {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, net) = s
            .rsplit_once('@')
            .ok_or_else(|| AddressParseError::MissingSeparator(s.to_string()))?;
        let net: NetId = net.parse()?;

        let addr = if net.lnd().has_ip_addresses() {
            addr.parse::<Ipv4Addr>()
                .map(u32::from)
                .map_err(|_| AddressParseError::InvalidAddress(s.to_string()))?
        } else {
            addr.parse::<u32>()
                .map_err(|_| AddressParseError::InvalidAddress(s.to_string()))?
        };

        Ok(Nid::new(net, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_net_components() {
        let net = NetId::new(LndType::O2ib, 3);
        assert_eq!(net.lnd(), LndType::O2ib);
        assert_eq!(net.number(), 3);
        assert!(!net.is_loopback());
        assert!(NetId::new(LndType::Loopback, 0).is_loopback());
    }

    #[test]
    fn test_nid_components() {
        let net = NetId::new(LndType::Socket, 1);
        let nid = Nid::new(net, 0x0a000001);
        assert_eq!(nid.net(), net);
        assert_eq!(nid.addr(), 0x0a000001);
        assert_eq!(Nid::ANY.net(), NetId::ANY);
    }

    #[test]
    fn test_nid_display() {
        let tcp = Nid::new(NetId::new(LndType::Socket, 0), u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(tcp.to_string(), "10.0.0.1@tcp");

        let gni = Nid::new(NetId::new(LndType::Gni, 1), 12);
        assert_eq!(gni.to_string(), "12@gni1");

        assert_eq!(Nid::ANY.to_string(), "<any>");
    }

    #[test]
    fn test_nid_parse() {
        let nid: Nid = "192.168.1.20@o2ib2".parse().unwrap();
        assert_eq!(nid.net(), NetId::new(LndType::O2ib, 2));
        assert_eq!(nid.addr(), u32::from(Ipv4Addr::new(192, 168, 1, 20)));

        let lo: Nid = "0@lo".parse().unwrap();
        assert!(lo.net().is_loopback());
    }

    #[test]
    fn test_nid_parse_errors() {
        assert!(matches!(
            "10.0.0.1".parse::<Nid>(),
            Err(AddressParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            "1@bogus".parse::<Nid>(),
            Err(AddressParseError::UnknownNetwork(_))
        ));
        assert!(matches!(
            "10.0.0@tcp".parse::<Nid>(),
            Err(AddressParseError::InvalidAddress(_))
        ));
        assert!(matches!(
            "tcp99999".parse::<NetId>(),
            Err(AddressParseError::InvalidNumber(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_nid_text_roundtrip(kind in 0usize..5, number in 0u16..1000, addr in any::<u32>()) {
            let lnd = [LndType::Socket, LndType::Ptl, LndType::O2ib, LndType::Loopback, LndType::Gni][kind];
            let nid = Nid::new(NetId::new(lnd, number), addr);
            let parsed: Nid = nid.to_string().parse().unwrap();
            prop_assert_eq!(parsed, nid);
        }
    }
}
