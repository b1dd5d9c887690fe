//! Link-layer addresses and datapath identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

/// An Ethernet MAC address.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// Build an address from the low 48 bits of `addr`, most significant byte first.
    pub fn from_u64(addr: u64) -> MacAddr {
        let mut arr = [0; 6];
        for (i, b) in arr.iter_mut().enumerate() {
            *b = ((addr >> (8 * (5 - i))) & 0xff) as u8;
        }
        MacAddr(arr)
    }

    pub fn to_u64(self) -> u64 {
        self.0.iter().fold(0, |acc, b| (acc << 8) | *b as u64)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == MacAddr::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::Mac(s.to_string());
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(err());
        }
        let mut arr = [0; 6];
        for (b, part) in arr.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(err());
            }
            *b = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        Ok(MacAddr(arr))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// OpenFlow datapath id of a switch. Rendered as 16 lowercase hex digits.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dpid(pub u64);

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Dpid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseError::Dpid(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Dpid)
            .map_err(|_| ParseError::Dpid(s.to_string()))
    }
}

impl Serialize for Dpid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dpid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_text_form() {
        let mac: MacAddr = "52:54:00:57:D7:64".parse().unwrap();
        assert_eq!(mac, MacAddr([0x52, 0x54, 0x00, 0x57, 0xd7, 0x64]));
        assert_eq!(mac.to_string(), "52:54:00:57:d7:64");
        assert!("52:54:00:57:d7".parse::<MacAddr>().is_err());
        assert!("52:54:00:57:d7:6".parse::<MacAddr>().is_err());
    }

    #[test]
    fn mac_integer_form() {
        let mac = MacAddr::from_u64(0x0202_0202_0203);
        assert_eq!(mac.to_string(), "02:02:02:02:02:03");
        assert_eq!(mac.to_u64(), 0x0202_0202_0203);
    }

    #[test]
    fn dpid_is_sixteen_hex_digits() {
        let dpid: Dpid = "000090b11c876975".parse().unwrap();
        assert_eq!(dpid, Dpid(0x90b1_1c87_6975));
        assert_eq!(Dpid(4).to_string(), "0000000000000004");
        assert!("90:b1".parse::<Dpid>().is_err());
        assert!("00000000000000001".parse::<Dpid>().is_err());
    }

    #[test]
    fn serde_uses_text_form() {
        let json = serde_json::to_string(&(MacAddr::BROADCAST, Dpid(10))).unwrap();
        assert_eq!(json, r#"["ff:ff:ff:ff:ff:ff","000000000000000a"]"#);
        let back: (MacAddr, Dpid) = serde_json::from_str(&json).unwrap();
        assert_eq!(back, (MacAddr::BROADCAST, Dpid(10)));
    }
}
