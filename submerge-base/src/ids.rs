use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(test)]
use test_log::test;

/// A 128-bit identifier, used for revision ids and chunk ids alike. Printed
/// and stored (per the local persistence interface) as lowercase hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash128(pub u64, pub u64);

impl Hash128 {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let hash = rapidhash::rapidhash(bytes);
        let hash2 = rapidhash::rapidhash(&hash.to_le_bytes());
        Hash128(hash, hash2)
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}{:016x}", self.0, self.1)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let hi = u64::from_str_radix(&s[0..16], 16).ok()?;
        let lo = u64::from_str_radix(&s[16..32], 16).ok()?;
        Some(Hash128(hi, lo))
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash128({})", self.to_hex())
    }
}

/// A Lamport-style 64-bit counter maintained per peer. Advances to
/// `max(local, received) + 1` on every received message; global ordering
/// is only guaranteed within a single chunk's lock scope.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
    pub const EPOCH: LogicalTime = LogicalTime(0);

    pub fn tick(&mut self) -> LogicalTime {
        self.0 += 1;
        *self
    }

    /// Advance past a time observed in an incoming message.
    pub fn observe(&mut self, received: LogicalTime) {
        self.0 = self.0.max(received.0) + 1;
    }

    pub fn next(self) -> LogicalTime {
        LogicalTime(self.0 + 1)
    }
}

impl fmt::Debug for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalTime({})", self.0)
    }
}

#[test]
fn test_hash128_hex_roundtrip() {
    let h = Hash128::from_bytes(b"chunk-7");
    let hex = h.to_hex();
    assert_eq!(hex.len(), 32);
    assert_eq!(Hash128::from_hex(&hex), Some(h));
}

#[test]
fn test_logical_time_observe() {
    let mut t = LogicalTime(5);
    t.observe(LogicalTime(3));
    assert_eq!(t, LogicalTime(6));
    t.observe(LogicalTime(9));
    assert_eq!(t, LogicalTime(10));
}
