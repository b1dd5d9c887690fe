//! MAC pair keys.
//!
//! Installed paths are cached per direction, traffic is aggregated per conversation. The two
//! keys are separate types so neither can be used where the other is meant.

use std::fmt;

use serde::Serialize;

use crate::mac::MacAddr;

/// Ordered `(source, destination)` key. `(a, b)` and `(b, a)` are different keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirectedMacPair {
    pub src: MacAddr,
    pub dst: MacAddr,
}

impl DirectedMacPair {
    pub fn new(src: MacAddr, dst: MacAddr) -> Self {
        DirectedMacPair { src, dst }
    }

    pub fn reversed(self) -> Self {
        DirectedMacPair::new(self.dst, self.src)
    }

    pub fn involves(&self, mac: MacAddr) -> bool {
        self.src == mac || self.dst == mac
    }
}

impl fmt::Display for DirectedMacPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.src, self.dst)
    }
}

/// Unordered pair, stored canonicalized with `mac1 <= mac2`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MacPair {
    mac1: MacAddr,
    mac2: MacAddr,
}

impl MacPair {
    pub fn new(a: MacAddr, b: MacAddr) -> Self {
        if a <= b {
            MacPair { mac1: a, mac2: b }
        } else {
            MacPair { mac1: b, mac2: a }
        }
    }

    pub fn mac1(&self) -> MacAddr {
        self.mac1
    }

    pub fn mac2(&self) -> MacAddr {
        self.mac2
    }
}

impl From<DirectedMacPair> for MacPair {
    fn from(pair: DirectedMacPair) -> Self {
        MacPair::new(pair.src, pair.dst)
    }
}

impl fmt::Display for MacPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {}", self.mac1, self.mac2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0x52, 0x54, 0, 0, 0, last])
    }

    #[test]
    fn directed_pairs_keep_order() {
        let ab = DirectedMacPair::new(mac(1), mac(2));
        assert_ne!(ab, ab.reversed());
        assert_eq!(ab.reversed().reversed(), ab);
        assert!(ab.involves(mac(2)));
        assert!(!ab.involves(mac(3)));
    }

    #[test]
    fn unordered_pairs_ignore_order() {
        let set: HashSet<MacPair> = [MacPair::new(mac(2), mac(1)), MacPair::new(mac(1), mac(2))]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 1);
        let pair = MacPair::new(mac(9), mac(3));
        assert_eq!(pair.mac1(), mac(3));
        assert_eq!(pair.to_string(), "52:54:00:00:00:03 <> 52:54:00:00:00:09");
        assert_eq!(
            serde_json::to_value(pair).unwrap(),
            serde_json::json!({"mac1": "52:54:00:00:00:03", "mac2": "52:54:00:00:00:09"})
        );
    }
}
