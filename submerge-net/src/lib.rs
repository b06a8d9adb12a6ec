#![allow(dead_code)]

// Client-server and server-server networking: the mesh transport (`hub`),
// peer discovery (`discovery`), the Chord directory adapter (`chord`), the
// replicated shard with its distributed read/write lock (`chunk`), and the
// collection of chunks that makes up one distributed table (`net_table`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use submerge_base::Error;

pub mod chord;
pub mod chunk;
pub mod discovery;
pub mod hub;
pub mod net_table;

#[cfg(test)]
use test_log::test;

/// Identifies a peer by the address its hub listens on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(pub SocketAddr);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        s.parse::<SocketAddr>().map(PeerId).map_err(|e| Error::invalid(format!("bad peer address {s}: {e}")))
    }
}

/// The wire envelope every message travels in: a type name used to dispatch
/// to a registered handler, the sender, and the type-specific payload
/// (`rmp_serde`-encoded). Built-in response types are reserved: `Ack`,
/// `Decline`, `Invalid`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    pub sender: PeerId,
    pub serialized: Vec<u8>,
}

pub const KIND_ACK: &str = "Ack";
pub const KIND_DECLINE: &str = "Decline";
pub const KIND_INVALID: &str = "Invalid";

impl Envelope {
    pub fn new<T: Serialize>(kind: impl Into<String>, sender: PeerId, payload: &T) -> Result<Envelope, Error> {
        Ok(Envelope { kind: kind.into(), sender, serialized: rmp_serde::to_vec(payload)? })
    }

    pub fn ack(sender: PeerId) -> Envelope {
        Envelope { kind: KIND_ACK.to_string(), sender, serialized: Vec::new() }
    }

    pub fn decline(sender: PeerId) -> Envelope {
        Envelope { kind: KIND_DECLINE.to_string(), sender, serialized: Vec::new() }
    }

    pub fn invalid(sender: PeerId, reason: impl Into<String>) -> Envelope {
        Envelope { kind: KIND_INVALID.to_string(), sender, serialized: reason.into().into_bytes() }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == KIND_ACK
    }

    pub fn is_decline(&self) -> bool {
        self.kind == KIND_DECLINE
    }

    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, Error> {
        Ok(rmp_serde::from_slice(&self.serialized)?)
    }
}

#[test]
fn test_envelope_payload_roundtrip() {
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let sender = PeerId(addr);
    let env = Envelope::new("Ping", sender, &42i64).unwrap();
    assert_eq!(env.kind, "Ping");
    let payload: i64 = env.payload().unwrap();
    assert_eq!(payload, 42);
}

#[test]
fn test_peer_id_ordering_is_total() {
    let a = PeerId("127.0.0.1:1000".parse().unwrap());
    let b = PeerId("127.0.0.1:2000".parse().unwrap());
    assert!(a < b);
}
