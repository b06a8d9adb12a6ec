// Chord directory adapter. The Chord ring itself (finger tables, successor
// lists, stabilization) is assumed to already exist as a reusable
// distributed-hash-table component; what this module owns is the thin
// translation layer a net-table uses to ask that ring "who holds chunk X"
// and to publish "I now hold chunk X" / "I no longer hold chunk X".
//
// `DirectoryStore` is the seam: `LocalDirectory` is an in-process
// compare-and-swap map standing in for the real ring during tests and
// single-process demos, and a production deployment would supply an
// implementation that actually walks the ring.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::PeerId;
use submerge_base::{Error, Hash128, Result};

#[cfg(test)]
use test_log::test;

/// A routed message addressed to whichever peer the ring currently
/// considers responsible for a key, wrapped with the net-table it concerns
/// so a peer that owns several tables can dispatch it correctly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutedChordRequest {
    pub table_name: String,
    pub serialized_message: Vec<u8>,
}

/// The ring-level operations a net-table's directory adapter can be asked
/// to relay. The successor/predecessor/finger/lock/replication kinds are
/// ring-maintenance traffic that properly belongs to the external Chord
/// component this adapter sits in front of; `handle_routed` answers them
/// with a minimal, honest stand-in (see its doc comment) rather than
/// leaving them unhandled, so the wire format is complete even before a
/// real ring is wired in underneath.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ChordMessage {
    AddData { key: String, value: Vec<u8> },
    RetrieveData { key: String },
    FetchResponsibilities,
    PushResponsibilities { entries: Vec<(String, Vec<u8>)> },
    GetClosestPrecedingFinger { key: String },
    GetSuccessor,
    GetPredecessor,
    Lock { key: String, holder: PeerId },
    Unlock { key: String, holder: PeerId },
    Notify { predecessor: PeerId },
    Replace { old: PeerId, new: PeerId },
    InitReplicator { successor: PeerId },
    AppendReplicationData { entries: Vec<(String, Vec<u8>)> },
    /// Reply carrying a single peer, used to answer the three lookup kinds
    /// above.
    Peer { peer: PeerId },
    /// Generic successful-acknowledgement reply.
    Ack,
}

/// A key/value map with atomic compare-and-swap, the one operation the
/// directory adapter needs from the ring (or its stand-in) beyond plain
/// get/put.
pub trait DirectoryStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn compare_and_swap(&self, key: &str, expected: Option<Vec<u8>>, new: Vec<u8>) -> bool;
}

/// In-process directory used by single-process tests and demos in place of
/// a real Chord ring.
#[derive(Default)]
pub struct LocalDirectory {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        LocalDirectory::default()
    }
}

impl DirectoryStore for LocalDirectory {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.lock().unwrap().get(key).cloned()
    }

    fn compare_and_swap(&self, key: &str, expected: Option<Vec<u8>>, new: Vec<u8>) -> bool {
        let mut map = self.map.lock().unwrap();
        if map.get(key).cloned() != expected {
            return false;
        }
        map.insert(key.to_string(), new);
        true
    }
}

/// A net-table's view of the directory: translates chunk ownership
/// questions into `DirectoryStore` operations, retrying while the ring
/// hasn't converged yet.
pub struct ChordAdapter {
    directory: Box<dyn DirectoryStore>,
    retries: u32,
    retry_spacing: Duration,
    last_heard: Mutex<BTreeMap<PeerId, Instant>>,
}

impl ChordAdapter {
    pub fn new(directory: Box<dyn DirectoryStore>, retries: u32, retry_spacing: Duration) -> Self {
        ChordAdapter { directory, retries, retry_spacing, last_heard: Mutex::new(BTreeMap::new()) }
    }

    fn peers_at(&self, key: &str) -> Option<BTreeSet<PeerId>> {
        self.directory.get(key).map(|bytes| rmp_serde::from_slice::<Vec<PeerId>>(&bytes).unwrap_or_default().into_iter().collect())
    }

    /// Returns the swarm for `chunk_id`, retrying while the directory has
    /// no entry yet (the ring may not have converged right after a chunk is
    /// created on another peer).
    pub fn seek_peers(&self, chunk_id: Hash128) -> Result<BTreeSet<PeerId>> {
        let key = chunk_id.to_hex();
        for attempt in 0..self.retries.max(1) {
            if let Some(peers) = self.peers_at(&key) {
                return Ok(peers);
            }
            if attempt + 1 < self.retries {
                thread::sleep(self.retry_spacing);
            }
        }
        Err(Error::directory_timeout(key))
    }

    /// Adds `peer` to the recorded swarm for `chunk_id`, retrying the
    /// compare-and-swap against concurrent announcers.
    pub fn announce_possession(&self, chunk_id: Hash128, peer: PeerId) -> Result<()> {
        let key = chunk_id.to_hex();
        for _ in 0..self.retries.max(1) {
            let current = self.directory.get(&key);
            let mut peers: BTreeSet<PeerId> =
                current.as_ref().map(|b| rmp_serde::from_slice::<Vec<PeerId>>(b).unwrap_or_default().into_iter().collect()).unwrap_or_default();
            if peers.contains(&peer) {
                return Ok(());
            }
            peers.insert(peer);
            let new = rmp_serde::to_vec(&peers.into_iter().collect::<Vec<_>>())?;
            if self.directory.compare_and_swap(&key, current, new) {
                return Ok(());
            }
        }
        Err(Error::directory_timeout(key))
    }

    /// Removes `peer` from the recorded swarm for `chunk_id`. Best effort:
    /// a peer leaving that can't win the compare-and-swap race logs and
    /// moves on rather than failing the whole `leave` operation.
    pub fn renounce_possession(&self, chunk_id: Hash128, peer: PeerId) -> Result<()> {
        let key = chunk_id.to_hex();
        for _ in 0..self.retries.max(1) {
            let current = self.directory.get(&key);
            let mut peers: BTreeSet<PeerId> =
                current.as_ref().map(|b| rmp_serde::from_slice::<Vec<PeerId>>(b).unwrap_or_default().into_iter().collect()).unwrap_or_default();
            if !peers.remove(&peer) {
                return Ok(());
            }
            let new = rmp_serde::to_vec(&peers.into_iter().collect::<Vec<_>>())?;
            if self.directory.compare_and_swap(&key, current, new) {
                return Ok(());
            }
        }
        debug!("renounce_possession for {peer} on chunk {key} did not converge, giving up");
        Ok(())
    }

    pub fn note_heard(&self, peer: PeerId) {
        self.last_heard.lock().unwrap().insert(peer, Instant::now());
    }

    /// Handles a request routed through the ring to this table's directory
    /// state, updating the sender's "last heard" timestamp first.
    ///
    /// `self_id` is the local peer's own address, needed to answer the
    /// ring-topology lookups below; this adapter keeps no finger table or
    /// successor/predecessor pointers of its own (that belongs to the
    /// external Chord component it fronts), so it answers every lookup with
    /// "ask me" and every ring-maintenance message with a bare ack. A
    /// caller layering a real ring under this adapter replaces these with
    /// actual routing; until then the wire format is complete and a caller
    /// only ever gets back a `Peer`/`Ack` rather than an unhandled message.
    pub fn handle_routed(&self, sender: PeerId, self_id: PeerId, msg: ChordMessage) -> ChordMessage {
        self.note_heard(sender);
        match msg {
            ChordMessage::AddData { key, value } => {
                self.directory.compare_and_swap(&key, self.directory.get(&key), value);
                ChordMessage::AddData { key, value: Vec::new() }
            }
            ChordMessage::RetrieveData { key } => {
                let value = self.directory.get(&key).unwrap_or_default();
                ChordMessage::RetrieveData { key: key.clone() }.with_value(value)
            }
            ChordMessage::FetchResponsibilities => ChordMessage::PushResponsibilities { entries: Vec::new() },
            ChordMessage::PushResponsibilities { entries } => {
                for (key, value) in &entries {
                    self.directory.compare_and_swap(key, self.directory.get(key), value.clone());
                }
                ChordMessage::PushResponsibilities { entries: Vec::new() }
            }
            ChordMessage::GetClosestPrecedingFinger { .. } | ChordMessage::GetSuccessor | ChordMessage::GetPredecessor => {
                ChordMessage::Peer { peer: self_id }
            }
            ChordMessage::AppendReplicationData { entries } => {
                for (key, value) in &entries {
                    self.directory.compare_and_swap(key, self.directory.get(key), value.clone());
                }
                ChordMessage::Ack
            }
            ChordMessage::Lock { .. }
            | ChordMessage::Unlock { .. }
            | ChordMessage::Notify { .. }
            | ChordMessage::Replace { .. }
            | ChordMessage::InitReplicator { .. }
            | ChordMessage::Peer { .. }
            | ChordMessage::Ack => ChordMessage::Ack,
        }
    }
}

impl ChordMessage {
    fn with_value(self, value: Vec<u8>) -> ChordMessage {
        match self {
            ChordMessage::RetrieveData { key } => ChordMessage::AddData { key, value },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ChordAdapter {
        ChordAdapter::new(Box::new(LocalDirectory::new()), 3, Duration::from_millis(1))
    }

    #[test]
    fn test_seek_peers_times_out_when_absent() {
        let a = adapter();
        let chunk_id = Hash128::from_bytes(b"chunk");
        assert!(matches!(a.seek_peers(chunk_id), Err(Error::DirectoryTimeout { .. })));
    }

    #[test]
    fn test_announce_then_seek_round_trips() {
        let a = adapter();
        let chunk_id = Hash128::from_bytes(b"chunk");
        let peer: PeerId = "127.0.0.1:3000".parse().unwrap();
        a.announce_possession(chunk_id, peer).unwrap();
        let peers = a.seek_peers(chunk_id).unwrap();
        assert!(peers.contains(&peer));
    }

    #[test]
    fn test_renounce_removes_peer() {
        let a = adapter();
        let chunk_id = Hash128::from_bytes(b"chunk");
        let peer: PeerId = "127.0.0.1:3000".parse().unwrap();
        a.announce_possession(chunk_id, peer).unwrap();
        a.renounce_possession(chunk_id, peer).unwrap();
        let peers = a.seek_peers(chunk_id).unwrap();
        assert!(!peers.contains(&peer));
    }

    #[test]
    fn test_handle_routed_ring_lookups_answer_with_self() {
        let a = adapter();
        let me: PeerId = "127.0.0.1:4000".parse().unwrap();
        let sender: PeerId = "127.0.0.1:4001".parse().unwrap();
        for msg in [
            ChordMessage::GetSuccessor,
            ChordMessage::GetPredecessor,
            ChordMessage::GetClosestPrecedingFinger { key: "k".to_string() },
        ] {
            assert!(matches!(a.handle_routed(sender, me, msg), ChordMessage::Peer { peer } if peer == me));
        }
    }

    #[test]
    fn test_handle_routed_ring_maintenance_acks() {
        let a = adapter();
        let me: PeerId = "127.0.0.1:4000".parse().unwrap();
        let sender: PeerId = "127.0.0.1:4001".parse().unwrap();
        let msg = ChordMessage::Lock { key: "k".to_string(), holder: sender };
        assert!(matches!(a.handle_routed(sender, me, msg), ChordMessage::Ack));
    }

    #[test]
    fn test_handle_routed_updates_last_heard() {
        let a = adapter();
        let me: PeerId = "127.0.0.1:4000".parse().unwrap();
        let sender: PeerId = "127.0.0.1:4001".parse().unwrap();
        a.handle_routed(sender, me, ChordMessage::GetSuccessor);
        assert!(a.last_heard.lock().unwrap().contains_key(&sender));
    }
}
