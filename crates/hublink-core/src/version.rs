//! Protocol version ordering.
//!
//! The handshake reports the hub's JSON-RPC protocol version as a
//! `"major.minor"` string. Comparison is numeric per component, so `"10.0"`
//! sorts above `"9.5"`.

use core::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parse error for a protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidVersion(pub String);

impl fmt::Display for InvalidVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid protocol version {:?}", self.0)
    }
}

impl std::error::Error for InvalidVersion {}

impl FromStr for ProtocolVersion {
    type Err = InvalidVersion;

    /// Accepts `"major.minor"`; further dot-separated components are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts.next().and_then(|p| p.parse().ok());
        match (major, minor) {
            (Some(major), Some(minor)) => Ok(Self { major, minor }),
            _ => Err(InvalidVersion(s.to_owned())),
        }
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_minor() {
        assert_eq!("6.2".parse(), Ok(ProtocolVersion::new(6, 2)));
        assert_eq!("6.2.1".parse(), Ok(ProtocolVersion::new(6, 2)));
        assert!("6".parse::<ProtocolVersion>().is_err());
        assert!("six.two".parse::<ProtocolVersion>().is_err());
        assert!("".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn orders_numerically_not_lexically() {
        let v9_5 = ProtocolVersion::new(9, 5);
        let v10_0 = ProtocolVersion::new(10, 0);
        assert!(v10_0 > v9_5);
        assert!(ProtocolVersion::new(6, 10) > ProtocolVersion::new(6, 2));
    }

    #[test]
    fn serde_round_trip() {
        let version = ProtocolVersion::new(6, 2);
        let json = serde_json::to_string(&version).unwrap();
        assert_eq!(json, "\"6.2\"");
        let back: ProtocolVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, version);
    }
}
