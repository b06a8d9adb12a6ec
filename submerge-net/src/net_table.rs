// A net-table: the set of chunks that together make up one distributed
// table on this peer, plus the RPC plumbing that lets chunks talk to their
// counterparts on other peers. `NetTable` owns the registered hub handlers
// and routes each inbound message either to itself (connect/init, which
// need to find or create a chunk) or to the named chunk (lock/unlock,
// insert/update replication, swarm membership).

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chord::{ChordAdapter, ChordMessage, RoutedChordRequest};
use crate::chunk::{Chunk, InitPayload, InsertRequestMsg, LeaveRequestMsg, LockBackoff, LockRequestMsg, NewPeerRequestMsg, UnlockRequestMsg, UpdateRequestMsg};
use crate::hub::Hub;
use crate::{Envelope, PeerId};
use submerge_base::{Error, Hash128, LogicalTime, Result};
use submerge_lang::{FieldValue, TableDescriptor};
use submerge_rowdb::LocalStore;
use submerge_vers::Revision;

#[cfg(test)]
use test_log::test;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ConnectRequestMsg {
    chunk_id: Hash128,
    from_peer: PeerId,
}

pub struct NetTable {
    name: String,
    self_id: PeerId,
    hub: Arc<Hub>,
    store: Arc<dyn LocalStore + Send + Sync>,
    descriptor: TableDescriptor,
    chord: Arc<ChordAdapter>,
    active_chunks: RwLock<BTreeMap<Hash128, Arc<Chunk>>>,
    backoff: LockBackoff,
}

impl NetTable {
    /// Builds the table and registers its RPC handlers with `hub`. Must be
    /// called before `hub.init()`.
    pub fn new(
        name: impl Into<String>,
        self_id: PeerId,
        hub: Arc<Hub>,
        store: Arc<dyn LocalStore + Send + Sync>,
        chord: Arc<ChordAdapter>,
        backoff: LockBackoff,
    ) -> Arc<NetTable> {
        let descriptor = store.descriptor().clone();
        let table = Arc::new(NetTable {
            name: name.into(),
            self_id,
            hub: Arc::clone(&hub),
            store,
            descriptor,
            chord,
            active_chunks: RwLock::new(BTreeMap::new()),
            backoff,
        });
        table.register_handlers();
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    fn register_handlers(self: &Arc<Self>) {
        macro_rules! handler {
            ($kind:literal, $method:ident) => {{
                let table = Arc::clone(self);
                self.hub.register_handler($kind, Box::new(move |env| table.$method(env)));
            }};
        }
        handler!("ConnectRequest", handle_connect_request);
        handler!("InitRequest", handle_init_request);
        handler!("LockRequest", handle_lock_request);
        handler!("UnlockRequest", handle_unlock_request);
        handler!("InsertRequest", handle_insert_request);
        handler!("UpdateRequest", handle_update_request);
        handler!("NewPeerRequest", handle_new_peer_request);
        handler!("LeaveRequest", handle_leave_request);
        handler!("ChordMessage", handle_chord_message);
    }

    fn chunk_for(&self, chunk_id: Hash128) -> Option<Arc<Chunk>> {
        self.active_chunks.read().unwrap().get(&chunk_id).cloned()
    }

    // --- Hub-registered handlers ---

    fn handle_connect_request(&self, env: &Envelope) -> Envelope {
        let msg: ConnectRequestMsg = match env.payload() {
            Ok(m) => m,
            Err(_) => return Envelope::invalid(self.self_id, "bad ConnectRequest payload"),
        };
        let Some(chunk) = self.chunk_for(msg.chunk_id) else {
            return Envelope::invalid(self.self_id, "unknown chunk");
        };
        let chord = Arc::clone(&self.chord);
        match chunk.request_participation(msg.from_peer, move |target| chord.announce_possession(msg.chunk_id, target)) {
            Ok(()) => Envelope::ack(self.self_id),
            Err(e) => {
                warn!("ConnectRequest from {} for chunk {} failed: {e}", msg.from_peer, msg.chunk_id);
                Envelope::decline(self.self_id)
            }
        }
    }

    fn handle_init_request(&self, env: &Envelope) -> Envelope {
        let payload: InitPayload = match env.payload() {
            Ok(p) => p,
            Err(_) => return Envelope::invalid(self.self_id, "bad InitRequest payload"),
        };
        let chunk_id = payload.chunk_id;
        let chunk = {
            let mut chunks = self.active_chunks.write().unwrap();
            chunks
                .entry(chunk_id)
                .or_insert_with(|| Chunk::new_uninitialized(chunk_id, self.self_id, Arc::clone(&self.hub), Arc::clone(&self.store), self.backoff))
                .clone()
        };
        match chunk.install_init_payload(payload) {
            Ok(()) => Envelope::ack(self.self_id),
            Err(e) => {
                warn!("installing InitRequest payload for chunk {chunk_id} failed: {e}");
                Envelope::decline(self.self_id)
            }
        }
    }

    fn handle_lock_request(&self, env: &Envelope) -> Envelope {
        let msg: LockRequestMsg = match env.payload() {
            Ok(m) => m,
            Err(_) => return Envelope::invalid(self.self_id, "bad LockRequest payload"),
        };
        match self.chunk_for(msg.chunk_id) {
            Some(chunk) => chunk.handle_lock_request(msg.locker),
            None => Envelope::invalid(self.self_id, "unknown chunk"),
        }
    }

    fn handle_unlock_request(&self, env: &Envelope) -> Envelope {
        let msg: UnlockRequestMsg = match env.payload() {
            Ok(m) => m,
            Err(_) => return Envelope::invalid(self.self_id, "bad UnlockRequest payload"),
        };
        match self.chunk_for(msg.chunk_id) {
            Some(chunk) => chunk.handle_unlock_request(msg.locker),
            None => Envelope::invalid(self.self_id, "unknown chunk"),
        }
    }

    fn handle_insert_request(&self, env: &Envelope) -> Envelope {
        let msg: InsertRequestMsg = match env.payload() {
            Ok(m) => m,
            Err(_) => return Envelope::invalid(self.self_id, "bad InsertRequest payload"),
        };
        match self.chunk_for(msg.chunk_id) {
            Some(chunk) => chunk.handle_insert_request(msg),
            None => Envelope::invalid(self.self_id, "unknown chunk"),
        }
    }

    fn handle_update_request(&self, env: &Envelope) -> Envelope {
        let msg: UpdateRequestMsg = match env.payload() {
            Ok(m) => m,
            Err(_) => return Envelope::invalid(self.self_id, "bad UpdateRequest payload"),
        };
        match self.chunk_for(msg.chunk_id) {
            Some(chunk) => chunk.handle_update_request(msg),
            None => Envelope::invalid(self.self_id, "unknown chunk"),
        }
    }

    fn handle_new_peer_request(&self, env: &Envelope) -> Envelope {
        let msg: NewPeerRequestMsg = match env.payload() {
            Ok(m) => m,
            Err(_) => return Envelope::invalid(self.self_id, "bad NewPeerRequest payload"),
        };
        match self.chunk_for(msg.chunk_id) {
            Some(chunk) => chunk.handle_new_peer_request(msg.new_peer),
            None => Envelope::invalid(self.self_id, "unknown chunk"),
        }
    }

    fn handle_leave_request(&self, env: &Envelope) -> Envelope {
        let msg: LeaveRequestMsg = match env.payload() {
            Ok(m) => m,
            Err(_) => return Envelope::invalid(self.self_id, "bad LeaveRequest payload"),
        };
        match self.chunk_for(msg.chunk_id) {
            Some(chunk) => chunk.handle_leave_request(msg.leaver),
            None => Envelope::invalid(self.self_id, "unknown chunk"),
        }
    }

    /// One physical RPC type (`ChordMessage`) carries every routed Chord
    /// overlay request; unwrap the envelope, make sure it's addressed to
    /// this table, and hand the decoded message to the chord adapter.
    fn handle_chord_message(&self, env: &Envelope) -> Envelope {
        let routed: RoutedChordRequest = match env.payload() {
            Ok(r) => r,
            Err(_) => return Envelope::invalid(self.self_id, "bad ChordMessage payload"),
        };
        if routed.table_name != self.name {
            return Envelope::invalid(self.self_id, "ChordMessage addressed to the wrong table");
        }
        let msg: ChordMessage = match rmp_serde::from_slice(&routed.serialized_message) {
            Ok(m) => m,
            Err(_) => return Envelope::invalid(self.self_id, "bad ChordMessage body"),
        };
        let reply = self.chord.handle_routed(env.sender, self.self_id, msg);
        let serialized_message = match rmp_serde::to_vec(&reply) {
            Ok(b) => b,
            Err(e) => return Envelope::invalid(self.self_id, format!("failed to encode ChordMessage reply: {e}")),
        };
        let out = RoutedChordRequest { table_name: self.name.clone(), serialized_message };
        Envelope::new("ChordMessage", self.self_id, &out).unwrap_or_else(|_| Envelope::invalid(self.self_id, "failed to build ChordMessage envelope"))
    }

    // --- Public operations ---

    /// Creates a brand-new, solely-owned chunk and announces it in the
    /// directory.
    pub fn new_chunk(&self) -> Result<Arc<Chunk>> {
        let id = Hash128(rand::thread_rng().gen(), rand::thread_rng().gen());
        let mut swarm = std::collections::BTreeSet::new();
        swarm.insert(self.self_id);
        let chunk = Chunk::new(id, self.self_id, Arc::clone(&self.hub), Arc::clone(&self.store), swarm, self.backoff);
        self.active_chunks.write().unwrap().insert(id, Arc::clone(&chunk));
        self.chord.announce_possession(id, self.self_id)?;
        Ok(chunk)
    }

    /// Returns a locally resident chunk, or pulls a copy from the network
    /// via the Chord directory and a `ConnectRequest`.
    pub fn get_chunk(&self, id: Hash128) -> Result<Arc<Chunk>> {
        if let Some(chunk) = self.chunk_for(id) {
            return Ok(chunk);
        }
        let placeholder = Chunk::new_uninitialized(id, self.self_id, Arc::clone(&self.hub), Arc::clone(&self.store), self.backoff);
        self.active_chunks.write().unwrap().insert(id, Arc::clone(&placeholder));

        let peers = self.chord.seek_peers(id)?;
        let owner = *peers.iter().find(|p| **p != self.self_id).ok_or_else(|| Error::not_found(id.to_hex()))?;
        let msg = ConnectRequestMsg { chunk_id: id, from_peer: self.self_id };
        let env = self.hub.request(owner, "ConnectRequest", &msg)?;
        if !env.is_ack() {
            self.active_chunks.write().unwrap().remove(&id);
            return Err(Error::decline());
        }
        placeholder.await_initialized();
        Ok(placeholder)
    }

    /// Returns a chunk this peer already belongs to, or creates a fresh one.
    /// Used both by `insert` and by submerge-txn when staging a new row.
    pub fn own_or_new_chunk(&self) -> Result<Arc<Chunk>> {
        let existing = self.active_chunks.read().unwrap().values().find(|c| c.swarm().contains(&self.self_id)).cloned();
        match existing {
            Some(chunk) => Ok(chunk),
            None => self.new_chunk(),
        }
    }

    /// Inserts a brand-new revision into a chunk this peer owns (creating
    /// one if it doesn't yet own any), returning the assigned chunk id.
    pub fn insert(&self, values: Vec<FieldValue>, id: Hash128, insert_time: LogicalTime) -> Result<Hash128> {
        let chunk = self.own_or_new_chunk()?;
        let rev = Revision::from_descriptor(&self.descriptor, values, id, chunk.id, insert_time)?;
        chunk.insert(rev)?;
        Ok(chunk.id)
    }

    pub fn update(&self, rev: Revision) -> Result<()> {
        let chunk = self.get_chunk(rev.chunk_id)?;
        chunk.update(rev)
    }

    /// Local-only lookup: searches every chunk already resident on this
    /// peer and never reaches out to the network, so it can't see an id
    /// living in a chunk this peer hasn't joined. Callers that know which
    /// chunk an id lives in and are willing to pull it over the wire should
    /// use `get_from_chunk` instead.
    pub fn get_by_id(&self, id: Hash128, at_time: LogicalTime) -> Result<Revision> {
        let chunks: Vec<Arc<Chunk>> = self.active_chunks.read().unwrap().values().cloned().collect();
        for chunk in chunks {
            if let Ok(rev) = chunk.get(id, at_time) {
                return Ok(rev);
            }
        }
        Err(Error::not_found(id.to_hex()))
    }

    /// Chunk-specified fast path: pulls `chunk_id` from its owner over the
    /// network if it isn't already resident, then reads `id` out of it.
    pub fn get_from_chunk(&self, chunk_id: Hash128, id: Hash128, at_time: LogicalTime) -> Result<Revision> {
        let chunk = self.get_chunk(chunk_id)?;
        chunk.get(id, at_time)
    }

    /// Scans only locally resident chunks; remote chunks are not consulted.
    pub fn find_fast(&self, field: &str, value: &FieldValue, at_time: LogicalTime) -> Result<Vec<Revision>> {
        self.store.find(field, value, at_time)
    }

    pub fn dump_active_chunks(&self, at_time: LogicalTime) -> Result<Vec<Revision>> {
        let chunks: Vec<Arc<Chunk>> = self.active_chunks.read().unwrap().values().cloned().collect();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(chunk.dump(at_time)?);
        }
        Ok(out)
    }

    /// Invites `target` into every chunk this peer currently holds, e.g.
    /// when evacuating before leaving the network.
    pub fn share_all_chunks(&self, target: PeerId) -> Result<()> {
        let chunks: Vec<Arc<Chunk>> = self.active_chunks.read().unwrap().values().cloned().collect();
        for chunk in chunks {
            let chord = Arc::clone(&self.chord);
            let chunk_id = chunk.id;
            chunk.request_participation(target, move |peer| chord.announce_possession(chunk_id, peer))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::LocalDirectory;
    use crate::hub::HubConfig;
    use submerge_lang::{FieldType, TableKind};
    use submerge_rowdb::RedbLocalStore;
    use std::time::Duration;

    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("widgets", TableKind::Cru, vec![("n".into(), FieldType::Uint32)])
    }

    fn make_table(dir: &std::path::Path, port_tag: &str, chord: Arc<ChordAdapter>) -> Arc<NetTable> {
        let hub = Hub::bind(HubConfig::default(), dir.join(format!("{port_tag}-discovery.txt"))).unwrap();
        let store: Arc<dyn LocalStore + Send + Sync> = Arc::new(RedbLocalStore::create_table(dir.join(format!("{port_tag}.redb")), descriptor()).unwrap());
        let table = NetTable::new("widgets", hub.own_address(), Arc::clone(&hub), store, chord, LockBackoff::default());
        hub.init().unwrap();
        table
    }

    #[test]
    fn test_solo_insert_and_find_fast() {
        let dir = tempfile::tempdir().unwrap();
        let chord = Arc::new(ChordAdapter::new(Box::new(LocalDirectory::new()), 3, Duration::from_millis(1)));
        let table = make_table(dir.path(), "a", chord);
        let id = Hash128::from_bytes(b"widget-1");
        table.insert(vec![FieldValue::Uint32(9)], id, LogicalTime(1)).unwrap();
        let found = table.find_fast("n", &FieldValue::Uint32(9), LogicalTime(1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }

    #[test]
    fn test_two_peers_share_a_chunk_via_connect() {
        let dir = tempfile::tempdir().unwrap();
        let shared_directory: Arc<LocalDirectory> = Arc::new(LocalDirectory::new());
        let chord_a = Arc::new(ChordAdapter::new(Box::new(ArcDirectory(Arc::clone(&shared_directory))), 5, Duration::from_millis(1)));
        let chord_b = Arc::new(ChordAdapter::new(Box::new(ArcDirectory(Arc::clone(&shared_directory))), 5, Duration::from_millis(1)));
        let table_a = make_table(dir.path(), "peer-a", chord_a);
        let table_b = make_table(dir.path(), "peer-b", chord_b);

        let id = Hash128::from_bytes(b"widget-shared");
        let _chunk_id = table_a.insert(vec![FieldValue::Uint32(3)], id, LogicalTime(1)).unwrap();

        table_a.share_all_chunks(table_b.self_id).unwrap();

        let pulled = table_b.get_by_id(id, LogicalTime(1)).unwrap();
        assert_eq!(pulled.get("n").unwrap(), &FieldValue::Uint32(3));
    }

    struct ArcDirectory(Arc<LocalDirectory>);
    impl crate::chord::DirectoryStore for ArcDirectory {
        fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.0.get(key)
        }
        fn compare_and_swap(&self, key: &str, expected: Option<Vec<u8>>, new: Vec<u8>) -> bool {
            self.0.compare_and_swap(key, expected, new)
        }
    }
}
