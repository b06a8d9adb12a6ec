// A chunk: one replicated shard of a net-table, backed by the shared local
// store and guarded by a distributed read/write lock. Writers acquire the
// lock from every swarm member in ascending `PeerId` order before mutating,
// which gives every peer the same total order to negotiate in and rules out
// the classic two-writer deadlock where A waits on B while B waits on A.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hub::Hub;
use crate::{Envelope, PeerId};
use submerge_base::{Error, Hash128, LogicalTime, Result};
use submerge_rowdb::LocalStore;
use submerge_vers::Revision;

#[cfg(test)]
use test_log::test;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockState {
    Free,
    LockedSelf,
    LockedOther(PeerId),
}

enum QueuedWrite {
    Insert(Revision),
    Update(Revision),
}

/// A single staged write, as handed to `Chunk::apply_staged` by a
/// transaction committing a batch under one lock acquisition.
#[derive(Clone, Debug)]
pub enum TxnWrite {
    Insert(Revision),
    Update(Revision),
}

struct LockInner {
    state: LockState,
    /// Write-lock session counter: reset whenever a new holder is granted
    /// the lock, so out-of-order delivery within a session can be detected.
    next_seq_expected: u64,
    write_seq_counter: u64,
    pending: BTreeMap<u64, QueuedWrite>,
    /// Peers blocked in `handle_lock_request`, waiting their turn once the
    /// current third-party holder releases.
    waiters: VecDeque<PeerId>,
}

impl Default for LockInner {
    fn default() -> Self {
        LockInner { state: LockState::Free, next_seq_expected: 1, write_seq_counter: 0, pending: BTreeMap::new(), waiters: VecDeque::new() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRequestMsg {
    pub chunk_id: Hash128,
    pub locker: PeerId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnlockRequestMsg {
    pub chunk_id: Hash128,
    pub locker: PeerId,
    pub writes: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InsertRequestMsg {
    pub chunk_id: Hash128,
    pub rev: Revision,
    pub write_seq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateRequestMsg {
    pub chunk_id: Hash128,
    pub rev: Revision,
    pub write_seq: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveRequestMsg {
    pub chunk_id: Hash128,
    pub leaver: PeerId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewPeerRequestMsg {
    pub chunk_id: Hash128,
    pub new_peer: PeerId,
    pub sender: PeerId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitPayload {
    pub chunk_id: Hash128,
    pub peers: BTreeSet<PeerId>,
    pub history: Vec<Revision>,
}

/// Backoff knobs for the distributed lock: how long to sleep, randomized,
/// after a decline before retrying acquisition from scratch.
#[derive(Clone, Copy, Debug)]
pub struct LockBackoff {
    pub min: Duration,
    pub max: Duration,
}

impl Default for LockBackoff {
    fn default() -> Self {
        LockBackoff { min: Duration::from_millis(1), max: Duration::from_millis(20) }
    }
}

pub struct Chunk {
    pub id: Hash128,
    self_id: PeerId,
    hub: Arc<Hub>,
    store: Arc<dyn LocalStore + Send + Sync>,
    swarm: Mutex<BTreeSet<PeerId>>,
    lock: Mutex<LockInner>,
    lock_cv: Condvar,
    initialized: Mutex<bool>,
    init_cv: Condvar,
    backoff: LockBackoff,
}

impl Chunk {
    pub fn new(id: Hash128, self_id: PeerId, hub: Arc<Hub>, store: Arc<dyn LocalStore + Send + Sync>, swarm: BTreeSet<PeerId>, backoff: LockBackoff) -> Arc<Chunk> {
        Arc::new(Chunk {
            id,
            self_id,
            hub,
            store,
            swarm: Mutex::new(swarm),
            lock: Mutex::new(LockInner::default()),
            lock_cv: Condvar::new(),
            initialized: Mutex::new(true),
            init_cv: Condvar::new(),
            backoff,
        })
    }

    /// Constructs an uninitialized placeholder for a chunk whose data is
    /// about to arrive via `install_init_payload`.
    pub fn new_uninitialized(id: Hash128, self_id: PeerId, hub: Arc<Hub>, store: Arc<dyn LocalStore + Send + Sync>, backoff: LockBackoff) -> Arc<Chunk> {
        Arc::new(Chunk {
            id,
            self_id,
            hub,
            store,
            swarm: Mutex::new(BTreeSet::new()),
            lock: Mutex::new(LockInner::default()),
            lock_cv: Condvar::new(),
            initialized: Mutex::new(false),
            init_cv: Condvar::new(),
            backoff,
        })
    }

    pub fn swarm(&self) -> BTreeSet<PeerId> {
        self.swarm.lock().unwrap().clone()
    }

    pub fn await_initialized(&self) {
        let mut guard = self.initialized.lock().unwrap();
        while !*guard {
            guard = self.init_cv.wait(guard).unwrap();
        }
    }

    /// Durably stores a freshly-received chunk's full history and swarm,
    /// then wakes anyone blocked in `await_initialized`. Used both by the
    /// pull path (`ConnectResponse`) and the push path (`InitRequest`).
    pub fn install_init_payload(&self, payload: InitPayload) -> Result<()> {
        for rev in payload.history {
            self.store.patch(rev)?;
        }
        *self.swarm.lock().unwrap() = payload.peers;
        let mut guard = self.initialized.lock().unwrap();
        *guard = true;
        self.init_cv.notify_all();
        Ok(())
    }

    fn sorted_swarm(&self) -> Vec<PeerId> {
        self.swarm.lock().unwrap().iter().cloned().collect()
    }

    fn prune_peer(&self, peer: PeerId) {
        self.swarm.lock().unwrap().remove(&peer);
        self.hub.forget_peer(peer);
    }

    /// Acquires the distributed lock by requesting it from every swarm
    /// member (ascending `PeerId` order) and rolls back on the first
    /// decline, retrying with randomized backoff.
    fn acquire(&self) -> Result<()> {
        loop {
            let swarm = self.sorted_swarm();
            let mut acquired: Vec<PeerId> = Vec::new();
            let mut declined = false;
            for peer in &swarm {
                if *peer == self.self_id {
                    let mut inner = self.lock.lock().unwrap();
                    inner.state = LockState::LockedSelf;
                    inner.next_seq_expected = 1;
                    continue;
                }
                let msg = LockRequestMsg { chunk_id: self.id, locker: self.self_id };
                match self.hub.request(*peer, "LockRequest", &msg) {
                    Ok(env) if env.is_ack() => acquired.push(*peer),
                    Ok(env) if env.is_decline() => {
                        declined = true;
                        break;
                    }
                    Ok(_) => {
                        declined = true;
                        break;
                    }
                    Err(_) => {
                        self.rollback(&acquired);
                        return Err(Error::lock_lost(self.id.to_hex()));
                    }
                }
            }
            if !declined {
                return Ok(());
            }
            self.rollback(&acquired);
            let backoff = random_backoff(self.backoff);
            debug!("lock acquisition for chunk {} declined, retrying in {backoff:?}", self.id);
            std::thread::sleep(backoff);
        }
    }

    fn rollback(&self, acquired: &[PeerId]) {
        let mut inner = self.lock.lock().unwrap();
        if inner.state == LockState::LockedSelf {
            inner.state = LockState::Free;
        }
        drop(inner);
        for peer in acquired.iter().rev() {
            let msg = UnlockRequestMsg { chunk_id: self.id, locker: self.self_id, writes: Vec::new() };
            let _ = self.hub.request(*peer, "UnlockRequest", &msg);
        }
    }

    /// Releases the lock from every swarm member, carrying the write_seq
    /// numbers applied during this session so replicas can confirm they
    /// received everything. Peers that turn out unreachable are dropped
    /// from the swarm (best effort).
    fn release(&self, applied_writes: Vec<u64>) {
        let swarm = self.sorted_swarm();
        for peer in &swarm {
            if *peer == self.self_id {
                let mut inner = self.lock.lock().unwrap();
                inner.state = LockState::Free;
                self.lock_cv.notify_all();
                continue;
            }
            let msg = UnlockRequestMsg { chunk_id: self.id, locker: self.self_id, writes: applied_writes.clone() };
            if self.hub.request(*peer, "UnlockRequest", &msg).is_err() {
                warn!("peer {peer} unreachable releasing lock on chunk {}, dropping from swarm", self.id);
                self.prune_peer(*peer);
            }
        }
    }

    pub fn insert(&self, rev: Revision) -> Result<()> {
        self.acquire()?;
        let result = self.apply_staged(&[TxnWrite::Insert(rev)]);
        match result {
            Ok(seqs) => {
                self.release(seqs);
                Ok(())
            }
            Err(e) => {
                self.release(Vec::new());
                Err(e)
            }
        }
    }

    pub fn update(&self, rev: Revision) -> Result<()> {
        self.acquire()?;
        let result = self.apply_staged(&[TxnWrite::Update(rev)]);
        match result {
            Ok(seqs) => {
                self.release(seqs);
                Ok(())
            }
            Err(e) => {
                self.release(Vec::new());
                Err(e)
            }
        }
    }

    pub fn get(&self, id: Hash128, at_time: LogicalTime) -> Result<Revision> {
        self.store.get(id, at_time)
    }

    /// Acquires the distributed lock ahead of a multi-write transaction
    /// commit; pairs with `release_for_txn`. Exposed for submerge-txn, which
    /// needs to hold several chunks' locks at once across a single commit.
    pub fn acquire_for_txn(&self) -> Result<()> {
        self.acquire()
    }

    pub fn release_for_txn(&self, applied_writes: Vec<u64>) {
        self.release(applied_writes)
    }

    /// Applies a batch of writes to the local store and replicates each to
    /// the swarm, assuming the caller already holds the lock. Returns the
    /// write_seq numbers assigned, for the caller to pass to `release`.
    pub fn apply_staged(&self, writes: &[TxnWrite]) -> Result<Vec<u64>> {
        let mut seqs = Vec::with_capacity(writes.len());
        for write in writes {
            let seq = {
                let mut inner = self.lock.lock().unwrap();
                inner.write_seq_counter += 1;
                inner.write_seq_counter
            };
            match write {
                TxnWrite::Insert(rev) => self.store.insert(rev.clone())?,
                TxnWrite::Update(rev) => self.store.update(rev.clone())?,
            }
            for peer in self.sorted_swarm() {
                if peer == self.self_id {
                    continue;
                }
                let sent = match write {
                    TxnWrite::Insert(rev) => {
                        self.hub.request(peer, "InsertRequest", &InsertRequestMsg { chunk_id: self.id, rev: rev.clone(), write_seq: seq })
                    }
                    TxnWrite::Update(rev) => {
                        self.hub.request(peer, "UpdateRequest", &UpdateRequestMsg { chunk_id: self.id, rev: rev.clone(), write_seq: seq })
                    }
                };
                if sent.is_err() {
                    warn!("peer {peer} unreachable replicating write on chunk {}, dropping from swarm", self.id);
                    self.prune_peer(peer);
                }
            }
            seqs.push(seq);
        }
        Ok(seqs)
    }

    pub fn dump(&self, at_time: LogicalTime) -> Result<Vec<Revision>> {
        Ok(self.store.dump(at_time)?.into_iter().filter(|r| r.chunk_id == self.id).collect())
    }

    /// Invites `target` into the swarm: locks the chunk, ships it the full
    /// history and swarm list via `InitRequest`, tells the rest of the
    /// swarm about the newcomer, and announces it in the directory via the
    /// supplied callback.
    pub fn request_participation(&self, target: PeerId, announce: impl Fn(PeerId) -> Result<()>) -> Result<()> {
        self.acquire()?;
        let result = (|| {
            let history = self.dump(LogicalTime(u64::MAX))?;
            let mut full_history = Vec::new();
            for rev in &history {
                full_history.extend(self.store.history(rev.id)?);
            }
            let mut peers = self.swarm();
            peers.insert(target);
            let payload = InitPayload { chunk_id: self.id, peers, history: full_history };
            let env = self.hub.request(target, "InitRequest", &payload)?;
            if !env.is_ack() {
                return Err(Error::decline());
            }
            for peer in self.sorted_swarm() {
                if peer == target || peer == self.self_id {
                    continue;
                }
                let msg = NewPeerRequestMsg { chunk_id: self.id, new_peer: target, sender: self.self_id };
                let _ = self.hub.request(peer, "NewPeerRequest", &msg);
            }
            self.swarm.lock().unwrap().insert(target);
            announce(target)
        })();
        self.release(Vec::new());
        result
    }

    pub fn leave(&self, announce_leave: impl Fn() -> Result<()>) -> Result<()> {
        self.acquire()?;
        for peer in self.sorted_swarm() {
            if peer == self.self_id {
                continue;
            }
            let msg = LeaveRequestMsg { chunk_id: self.id, leaver: self.self_id };
            let _ = self.hub.request(peer, "LeaveRequest", &msg);
        }
        self.swarm.lock().unwrap().remove(&self.self_id);
        let result = announce_leave();
        self.release(Vec::new());
        result
    }

    // --- Inbound handlers, invoked by net_table's dispatcher ---

    pub fn handle_lock_request(&self, locker: PeerId) -> Envelope {
        loop {
            let mut inner = self.lock.lock().unwrap();
            match inner.state {
                LockState::Free => {
                    inner.state = LockState::LockedOther(locker);
                    inner.next_seq_expected = 1;
                    return Envelope::ack(self.self_id);
                }
                LockState::LockedOther(holder) if holder == locker => return Envelope::ack(self.self_id),
                LockState::LockedSelf => return Envelope::decline(self.self_id),
                LockState::LockedOther(_) => {
                    inner.waiters.push_back(locker);
                    inner = self.lock_cv.wait(inner).unwrap();
                    drop(inner);
                    continue;
                }
            }
        }
    }

    pub fn handle_unlock_request(&self, locker: PeerId) -> Envelope {
        let mut inner = self.lock.lock().unwrap();
        match inner.state {
            LockState::LockedOther(holder) if holder == locker => {
                inner.state = LockState::Free;
                inner.waiters.pop_front();
                self.lock_cv.notify_all();
                Envelope::ack(self.self_id)
            }
            _ => Envelope::decline(self.self_id),
        }
    }

    fn apply_replicated_write(&self, write_seq: u64, write: QueuedWrite) -> Result<()> {
        let mut inner = self.lock.lock().unwrap();
        inner.pending.insert(write_seq, write);
        while let Some(next) = inner.pending.remove(&inner.next_seq_expected) {
            let seq = inner.next_seq_expected;
            inner.next_seq_expected += 1;
            drop(inner);
            let result = match next {
                QueuedWrite::Insert(rev) => self.store.insert(rev),
                QueuedWrite::Update(rev) => self.store.update(rev),
            };
            if let Err(e) = result {
                debug!("applying replicated write {seq} on chunk {}: {e}", self.id);
            }
            inner = self.lock.lock().unwrap();
        }
        Ok(())
    }

    pub fn handle_insert_request(&self, msg: InsertRequestMsg) -> Envelope {
        match self.apply_replicated_write(msg.write_seq, QueuedWrite::Insert(msg.rev)) {
            Ok(()) => Envelope::ack(self.self_id),
            Err(_) => Envelope::decline(self.self_id),
        }
    }

    pub fn handle_update_request(&self, msg: UpdateRequestMsg) -> Envelope {
        match self.apply_replicated_write(msg.write_seq, QueuedWrite::Update(msg.rev)) {
            Ok(()) => Envelope::ack(self.self_id),
            Err(_) => Envelope::decline(self.self_id),
        }
    }

    pub fn handle_new_peer_request(&self, new_peer: PeerId) -> Envelope {
        self.swarm.lock().unwrap().insert(new_peer);
        Envelope::ack(self.self_id)
    }

    pub fn handle_leave_request(&self, leaver: PeerId) -> Envelope {
        self.swarm.lock().unwrap().remove(&leaver);
        Envelope::ack(self.self_id)
    }
}

fn random_backoff(backoff: LockBackoff) -> Duration {
    use rand::Rng;
    let min = backoff.min.as_millis().max(1) as u64;
    let max = backoff.max.as_millis().max(min + 1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..max))
}
