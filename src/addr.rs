//! Address primitives: IPV4 and MAC addresses.
//!
//! Both types are plain byte arrays under the hood, matching the wire
//! representation exactly, with the usual parsing, formatting, and bitwise
//! helpers layered on top.

use std::fmt;
use std::net::Ipv4Addr as StdIpv4Addr;
use std::str::FromStr;

use byte_struct::*;
use static_assertions::const_assert;

/// A 4-octet IPV4 address.
///
/// Always exactly four octets; there is no representation of a "no address"
/// state other than `0.0.0.0`, matching the wire format.
#[derive(ByteStruct, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[byte_struct_be]
pub struct Ipv4Address {
    octets: [u8; 4],
}

const_assert!(Ipv4Address::BYTE_LEN == 4);

impl Ipv4Address {
    /// The unspecified address, `0.0.0.0`.
    pub const ANY: Ipv4Address = Ipv4Address { octets: [0; 4] };

    /// The limited broadcast address, `255.255.255.255`.
    pub const BROADCAST: Ipv4Address = Ipv4Address { octets: [0xFF; 4] };

    /// Build from four octets.
    pub const fn new(octets: [u8; 4]) -> Self {
        Ipv4Address { octets }
    }

    /// Build from a big-endian byte slice. Panics if `bytes` is shorter than four octets,
    /// since a caller handing us a short slice is a programmer error, not malformed wire input.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut octets = [0_u8; 4];
        octets.copy_from_slice(&bytes[0..4]);
        Ipv4Address { octets }
    }

    /// The four octets, most significant first.
    pub const fn octets(&self) -> [u8; 4] {
        self.octets
    }

    /// Lossless conversion to a 32-bit unsigned integer, most significant octet first.
    pub const fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.octets)
    }

    /// Lossless conversion from a 32-bit unsigned integer, most significant octet first.
    pub const fn from_u32(value: u32) -> Self {
        Ipv4Address { octets: value.to_be_bytes() }
    }

    /// True if every octet is `0xFF` (the limited broadcast address).
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn bitand(&self, other: &Ipv4Address) -> Ipv4Address {
        Self::from_u32(self.to_u32() & other.to_u32())
    }

    pub fn bitor(&self, other: &Ipv4Address) -> Ipv4Address {
        Self::from_u32(self.to_u32() | other.to_u32())
    }

    pub fn bitxor(&self, other: &Ipv4Address) -> Ipv4Address {
        Self::from_u32(self.to_u32() ^ other.to_u32())
    }

    pub fn not(&self) -> Ipv4Address {
        Self::from_u32(!self.to_u32())
    }
}

impl fmt::Debug for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl FromStr for Ipv4Address {
    type Err = AddrParseError;

    /// Parse a dotted-decimal address such as `192.168.13.37`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed: StdIpv4Addr = s.parse().map_err(|_| AddrParseError(s.to_string()))?;
        Ok(Ipv4Address { octets: parsed.octets() })
    }
}

impl From<StdIpv4Addr> for Ipv4Address {
    fn from(value: StdIpv4Addr) -> Self {
        Ipv4Address { octets: value.octets() }
    }
}

impl From<Ipv4Address> for StdIpv4Addr {
    fn from(value: Ipv4Address) -> Self {
        StdIpv4Addr::from(value.octets)
    }
}

/// A 6-octet Ethernet MAC address.
///
/// Always exactly six octets.
#[derive(ByteStruct, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[byte_struct_be]
pub struct MacAddress {
    octets: [u8; 6],
}

const_assert!(MacAddress::BYTE_LEN == 6);

impl MacAddress {
    /// The broadcast address, `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: MacAddress = MacAddress { octets: [0xFF; 6] };

    /// The all-zero address. Used as a placeholder, never a real endpoint.
    pub const ANY: MacAddress = MacAddress { octets: [0; 6] };

    /// Build from six octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddress { octets }
    }

    /// Build from a byte slice. Panics if shorter than six octets.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut octets = [0_u8; 6];
        octets.copy_from_slice(&bytes[0..6]);
        MacAddress { octets }
    }

    /// The six octets, in transmission order.
    pub const fn octets(&self) -> [u8; 6] {
        self.octets
    }

    /// True if every octet is `0xFF`.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = AddrParseError;

    /// Parse colon-hex text such as `00:0c:13:37:42:69`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0_u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddrParseError(s.to_string()));
        }
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_string()))?;
        }
        Ok(MacAddress { octets })
    }
}

/// An address string failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrParseError(pub String);

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address: {:?}", self.0)
    }
}

impl std::error::Error for AddrParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trips_through_bytes_and_u32() {
        let addr = Ipv4Address::new([192, 168, 13, 37]);
        assert_eq!(Ipv4Address::from_u32(addr.to_u32()), addr);
        let mut bytes = [0_u8; 4];
        addr.write_bytes(&mut bytes);
        assert_eq!(Ipv4Address::read_bytes(&bytes), addr);
    }

    #[test]
    fn ipv4_parses_dotted_decimal() {
        let addr: Ipv4Address = "192.168.13.37".parse().unwrap();
        assert_eq!(addr, Ipv4Address::new([192, 168, 13, 37]));
        assert_eq!(addr.to_string(), "192.168.13.37");
    }

    #[test]
    fn ipv4_rejects_garbage() {
        assert!("not-an-address".parse::<Ipv4Address>().is_err());
    }

    #[test]
    fn ipv4_bitops() {
        let ip = Ipv4Address::new([192, 168, 0, 37]);
        let mask = Ipv4Address::new([255, 255, 0, 0]);
        assert_eq!(ip.bitand(&mask), Ipv4Address::new([192, 168, 0, 0]));
        let broadcast = ip.bitand(&mask).bitor(&mask.not());
        assert_eq!(broadcast, Ipv4Address::new([192, 168, 255, 255]));
    }

    #[test]
    fn ipv4_broadcast_test() {
        assert!(Ipv4Address::BROADCAST.is_broadcast());
        assert!(!Ipv4Address::ANY.is_broadcast());
    }

    #[test]
    fn mac_parses_colon_hex() {
        let mac: MacAddress = "00:0c:13:37:42:69".parse().unwrap();
        assert_eq!(mac, MacAddress::new([0x00, 0x0c, 0x13, 0x37, 0x42, 0x69]));
        assert_eq!(mac.to_string(), "00:0c:13:37:42:69");
    }

    #[test]
    fn mac_broadcast_test() {
        assert!(MacAddress::BROADCAST.is_broadcast());
        assert!(!MacAddress::new([1, 2, 3, 4, 5, 6]).is_broadcast());
    }
}
