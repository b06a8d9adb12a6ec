#![allow(dead_code)]

// The optimistic, multi-chunk transaction engine: stage reads and writes
// against one or more chunks without taking any lock, then commit by
// acquiring every touched chunk's distributed lock (in ascending chunk-id
// order, the same rule `Chunk::acquire` itself uses for swarm members) and
// validating that nothing this transaction read has changed since. A
// conflict on any chunk aborts the whole commit; nothing partially lands.
//
// `Cache` sits on top of a `NetTableTransaction`: it lazily materializes
// typed objects from revisions, tracks which ones a caller has mutated, and
// write-throughs the dirty ones into the transaction at `prepare_for_commit`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use submerge_base::{Error, Hash128, LogicalTime, Result};
use submerge_lang::FieldValue;
use submerge_net::chunk::{Chunk, TxnWrite};
use submerge_net::net_table::NetTable;
use submerge_vers::Revision;

#[cfg(test)]
use test_log::test;

/// Tracks, per id read during a transaction, the `update_time` observed at
/// read time. At commit, each chunk is re-checked under its lock: if any
/// watched id now has a different `update_time`, the transaction conflicts.
#[derive(Default)]
pub struct ConflictMap {
    reads: BTreeMap<Hash128, LogicalTime>,
}

impl ConflictMap {
    pub fn new() -> Self {
        ConflictMap::default()
    }

    pub fn record_read(&mut self, id: Hash128, update_time: LogicalTime) {
        self.reads.entry(id).or_insert(update_time);
    }

    /// Re-reads every watched id from `chunk` at `at_time`, assuming the
    /// caller already holds the chunk's lock, and fails with
    /// `Error::Conflict` on the first mismatch.
    fn validate(&self, chunk: &Chunk, at_time: LogicalTime) -> Result<()> {
        for (&id, &seen) in &self.reads {
            match chunk.get(id, at_time) {
                Ok(rev) if rev.update_time == seen => {}
                Ok(rev) => {
                    return Err(Error::conflict(id.to_hex(), format!("read at {seen:?}, now {:?}", rev.update_time)));
                }
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// The writes staged for a single chunk, not yet committed. `removals`
/// duplicates the ids of any staged write that is a tombstone (CRU tables
/// have no hard delete; removing a row stages an update with `removed`
/// set), purely as bookkeeping so callers like `Cache` don't have to
/// re-inspect every staged `Revision` to tell inserts/updates from removes.
struct ChunkTransaction {
    chunk: Arc<Chunk>,
    writes: Vec<TxnWrite>,
    removals: BTreeSet<Hash128>,
}

impl ChunkTransaction {
    fn new(chunk: Arc<Chunk>) -> Self {
        ChunkTransaction { chunk, writes: Vec::new(), removals: BTreeSet::new() }
    }

    fn chunk_id(&self) -> Hash128 {
        self.chunk.id
    }

    fn stage(&mut self, write: TxnWrite) {
        self.writes.push(write);
    }

    /// Stages a tombstone: `rev` must already have `removed` set and be
    /// chained off the row's current version.
    fn stage_removal(&mut self, id: Hash128, rev: Revision) {
        self.removals.insert(id);
        self.writes.push(TxnWrite::Update(rev));
    }
}

/// A transaction against one net-table: every chunk it touches commits
/// together, in ascending chunk-id order.
pub struct NetTableTransaction {
    table: Arc<NetTable>,
    chunks: BTreeMap<Hash128, ChunkTransaction>,
    conflicts: ConflictMap,
}

impl NetTableTransaction {
    pub fn new(table: Arc<NetTable>) -> Self {
        NetTableTransaction { table, chunks: BTreeMap::new(), conflicts: ConflictMap::new() }
    }

    fn chunk_txn(&mut self, chunk: Arc<Chunk>) -> &mut ChunkTransaction {
        self.chunks.entry(chunk.id).or_insert_with(|| ChunkTransaction::new(chunk))
    }

    /// Stages a new row in a chunk this peer owns (creating one if
    /// necessary). Returns the chunk id the row will be inserted under.
    pub fn insert(&mut self, values: Vec<FieldValue>, id: Hash128, insert_time: LogicalTime) -> Result<Hash128> {
        let chunk = self.table.own_or_new_chunk()?;
        let chunk_id = chunk.id;
        let rev = Revision::from_descriptor(self.table.descriptor(), values, id, chunk_id, insert_time)?;
        self.chunk_txn(chunk).stage(TxnWrite::Insert(rev));
        Ok(chunk_id)
    }

    /// Reads `id` from `chunk_id` as of `at_time` and records the
    /// observation for conflict validation at commit.
    pub fn get(&mut self, chunk_id: Hash128, id: Hash128, at_time: LogicalTime) -> Result<Revision> {
        let chunk = self.table.get_chunk(chunk_id)?;
        let rev = chunk.get(id, at_time)?;
        self.conflicts.record_read(id, rev.update_time);
        Ok(rev)
    }

    /// Stages a whole-row overwrite of `id`'s fields, chained off the
    /// version currently on record.
    pub fn update(&mut self, chunk_id: Hash128, id: Hash128, values: Vec<FieldValue>, at_time: LogicalTime) -> Result<()> {
        let chunk = self.table.get_chunk(chunk_id)?;
        let current = chunk.get(id, at_time)?;
        self.conflicts.record_read(id, current.update_time);
        let mut next = current.next_version();
        for (name, value) in self.table.descriptor().field_names().map(str::to_string).collect::<Vec<_>>().into_iter().zip(values) {
            next.set(&name, value)?;
        }
        next.stamp_update(at_time.next());
        self.chunk_txn(chunk).stage(TxnWrite::Update(next));
        Ok(())
    }

    /// Stages a tombstone for `id` (CRU tables have no hard delete: this
    /// chains a new version off the current one with `removed` set, same as
    /// `update`, so `History::at_time` stops surfacing it from this point
    /// on).
    pub fn remove(&mut self, chunk_id: Hash128, id: Hash128, at_time: LogicalTime) -> Result<()> {
        let chunk = self.table.get_chunk(chunk_id)?;
        let current = chunk.get(id, at_time)?;
        self.conflicts.record_read(id, current.update_time);
        let mut next = current.next_version();
        next.removed = true;
        next.stamp_update(at_time.next());
        self.chunk_txn(chunk).stage_removal(id, next);
        Ok(())
    }

    /// Folds `other`'s staged writes into `self`. Each write is
    /// re-validated against the chunk's *current* state rather than trusted
    /// wholesale: an id `other` staged a write for is re-checked against
    /// whatever update time `other` observed when it read that id (if any);
    /// a mismatch means the row moved on since, and the id is reported
    /// through `conflicts` and dropped rather than failing the whole merge.
    /// Ids `other` never read (a bare insert, say) are taken as clean.
    pub fn merge(&mut self, other: NetTableTransaction, at_time: LogicalTime, conflicts: &mut Vec<Hash128>) -> Result<()> {
        let other_reads = other.conflicts.reads.clone();
        for (_, other_ct) in other.chunks {
            let chunk = other_ct.chunk;
            for write in other_ct.writes {
                let (id, is_removal) = match &write {
                    TxnWrite::Insert(rev) => (rev.id, false),
                    TxnWrite::Update(rev) => (rev.id, rev.removed),
                };
                let clean = match other_reads.get(&id) {
                    Some(&seen) => match chunk.get(id, at_time) {
                        Ok(rev) => rev.update_time == seen,
                        Err(Error::NotFound { .. }) => true,
                        Err(e) => return Err(e),
                    },
                    None => true,
                };
                if !clean {
                    conflicts.push(id);
                    continue;
                }
                let ct = self.chunk_txn(Arc::clone(&chunk));
                if is_removal {
                    ct.removals.insert(id);
                }
                ct.stage(write);
            }
        }
        for (id, seen) in other_reads {
            self.conflicts.record_read(id, seen);
        }
        Ok(())
    }

    /// Acquires every touched chunk's lock in ascending chunk-id order,
    /// validates this transaction's conflict map under each, and only then
    /// applies the staged writes. Every chunk it locked is released,
    /// whether the commit succeeds or fails.
    pub fn commit(self, at_time: LogicalTime) -> Result<()> {
        let mut chunk_txns: Vec<ChunkTransaction> = self.chunks.into_values().collect();
        chunk_txns.sort_by_key(ChunkTransaction::chunk_id);

        let mut locked: Vec<&ChunkTransaction> = Vec::new();
        let validation = (|| {
            for ct in &chunk_txns {
                ct.chunk.acquire_for_txn()?;
                locked.push(ct);
                self.conflicts.validate(&ct.chunk, at_time)?;
            }
            Ok(())
        })();

        let result: Result<Vec<(Hash128, Vec<u64>)>> = validation.and_then(|()| {
            let mut all_seqs = Vec::new();
            for ct in &chunk_txns {
                let seqs = ct.chunk.apply_staged(&ct.writes)?;
                all_seqs.push((ct.chunk_id(), seqs));
            }
            Ok(all_seqs)
        });

        for ct in locked.iter().rev() {
            let seqs = result.as_ref().ok().and_then(|all| all.iter().find(|(id, _)| *id == ct.chunk_id()).map(|(_, s)| s.clone())).unwrap_or_default();
            ct.chunk.release_for_txn(seqs);
        }
        result.map(|_| ())
    }
}

/// Whether a table is being touched through a transaction directly
/// (`Transaction::table`) or through an attached `Cache`. The two are
/// mutually exclusive per table per transaction: mixing them would let a
/// direct write and a cached write race to flush the same row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AccessMode {
    Direct,
    Cache,
}

/// A cache a `Transaction` can hold without knowing its value type `V`, so
/// several differently-typed caches can be attached to one transaction and
/// flushed together ahead of commit.
pub trait FlushableCache: Send + Sync {
    fn net_table(&self) -> Arc<NetTable>;
    fn flush(&self, txn: &mut NetTableTransaction) -> Result<()>;
}

impl<V: Send + Sync + 'static> FlushableCache for Cache<V> {
    fn net_table(&self) -> Arc<NetTable> {
        Arc::clone(&self.table)
    }

    fn flush(&self, txn: &mut NetTableTransaction) -> Result<()> {
        self.prepare_for_commit(txn)
    }
}

/// A transaction spanning several net-tables, each committed in turn
/// (alphabetical by table name, for a deterministic order across
/// concurrently-running multi-table transactions). Commit is not atomic
/// *across* tables: a failure partway through leaves earlier tables'
/// writes landed. Every individual table's commit is atomic across its own
/// chunks.
///
/// `begin_time` is the logical time this transaction's reads are taken
/// against; every attached cache and directly-accessed table shares it.
pub struct Transaction {
    begin_time: LogicalTime,
    table_txns: BTreeMap<String, NetTableTransaction>,
    access_mode: BTreeMap<String, AccessMode>,
    attached_caches: Vec<Arc<dyn FlushableCache>>,
}

impl Transaction {
    pub fn new(begin_time: LogicalTime) -> Self {
        Transaction { begin_time, table_txns: BTreeMap::new(), access_mode: BTreeMap::new(), attached_caches: Vec::new() }
    }

    pub fn begin_time(&self) -> LogicalTime {
        self.begin_time
    }

    /// Direct, table-level access to `table`. Errors if `table` already has
    /// a cache attached in this transaction.
    pub fn table(&mut self, table: Arc<NetTable>) -> Result<&mut NetTableTransaction> {
        let name = table.name().to_string();
        if self.access_mode.get(&name) == Some(&AccessMode::Cache) {
            return Err(Error::invalid(format!("table {name} already has a cache attached in this transaction")));
        }
        self.access_mode.insert(name.clone(), AccessMode::Direct);
        Ok(self.table_txns.entry(name).or_insert_with(|| NetTableTransaction::new(table)))
    }

    /// Attaches `cache` so its dirty/inserted/removed rows flush into this
    /// transaction's commit. Errors if `cache`'s table already has a direct
    /// `NetTableTransaction` in this transaction.
    pub fn attach_cache(&mut self, cache: Arc<dyn FlushableCache>) -> Result<()> {
        let name = cache.net_table().name().to_string();
        if self.access_mode.get(&name) == Some(&AccessMode::Direct) {
            return Err(Error::invalid(format!("table {name} is already accessed directly in this transaction")));
        }
        self.access_mode.insert(name, AccessMode::Cache);
        self.attached_caches.push(cache);
        Ok(())
    }

    /// Folds `other` into `self`: every table `other` touched is merged via
    /// `NetTableTransaction::merge`, with conflicting ids collected into
    /// `conflicts` rather than aborting outright.
    pub fn merge(&mut self, other: Transaction, at_time: LogicalTime, conflicts: &mut Vec<Hash128>) -> Result<()> {
        for (name, other_txn) in other.table_txns {
            if self.access_mode.get(&name) == Some(&AccessMode::Cache) {
                return Err(Error::invalid(format!("table {name} has a cache attached in this transaction and can't accept a direct merge")));
            }
            self.access_mode.insert(name.clone(), AccessMode::Direct);
            let table = Arc::clone(&other_txn.table);
            let mine = self.table_txns.entry(name).or_insert_with(|| NetTableTransaction::new(table));
            mine.merge(other_txn, at_time, conflicts)?;
        }
        Ok(())
    }

    /// Flushes every attached cache into its table's transaction, then
    /// commits every table's transaction in turn.
    pub fn commit(mut self, at_time: LogicalTime) -> Result<()> {
        for cache in &self.attached_caches {
            let table = cache.net_table();
            let name = table.name().to_string();
            let txn = self.table_txns.entry(name).or_insert_with(|| NetTableTransaction::new(table));
            cache.flush(txn)?;
        }
        for (name, txn) in self.table_txns {
            txn.commit(at_time).map_err(|e| {
                debug!("transaction commit on table {name} failed: {e}");
                e
            })?;
        }
        Ok(())
    }
}

/// A lazily-materialized, typed view over rows in one net-table, on top of
/// a `NetTableTransaction`. `get` loads and caches an object; `mark_dirty`
/// flags it as written; `insert` stages a brand-new row; `erase` stages a
/// removal; `prepare_for_commit` folds all of that into a
/// `NetTableTransaction`.
pub struct Cache<V> {
    table: Arc<NetTable>,
    at_time: LogicalTime,
    loaded: RwLock<BTreeMap<Hash128, Arc<Mutex<V>>>>,
    chunk_of: Mutex<BTreeMap<Hash128, Hash128>>,
    dirty: Mutex<BTreeSet<Hash128>>,
    inserted: Mutex<BTreeSet<Hash128>>,
    removed: Mutex<BTreeSet<Hash128>>,
    from_revision: Box<dyn Fn(&Revision) -> Result<V> + Send + Sync>,
    to_values: Box<dyn Fn(&V) -> Vec<FieldValue> + Send + Sync>,
}

impl<V: Send + Sync + 'static> Cache<V> {
    pub fn new(
        table: Arc<NetTable>,
        at_time: LogicalTime,
        from_revision: impl Fn(&Revision) -> Result<V> + Send + Sync + 'static,
        to_values: impl Fn(&V) -> Vec<FieldValue> + Send + Sync + 'static,
    ) -> Self {
        Cache {
            table,
            at_time,
            loaded: RwLock::new(BTreeMap::new()),
            chunk_of: Mutex::new(BTreeMap::new()),
            dirty: Mutex::new(BTreeSet::new()),
            inserted: Mutex::new(BTreeSet::new()),
            removed: Mutex::new(BTreeSet::new()),
            from_revision: Box::new(from_revision),
            to_values: Box::new(to_values),
        }
    }

    /// Returns the cached object for `id`, materializing it via the table's
    /// local-only lookup on first access. Fails `NotFound` for an id this
    /// cache has staged a removal for, even if it's still resident locally.
    pub fn get(&self, id: Hash128) -> Result<Arc<Mutex<V>>> {
        if let Some(existing) = self.loaded.read().unwrap().get(&id) {
            return Ok(Arc::clone(existing));
        }
        if self.removed.lock().unwrap().contains(&id) {
            return Err(Error::not_found(id.to_hex()));
        }
        let rev = self.table.get_by_id(id, self.at_time)?;
        let value = (self.from_revision)(&rev)?;
        let handle = Arc::new(Mutex::new(value));
        self.loaded.write().unwrap().insert(id, Arc::clone(&handle));
        self.chunk_of.lock().unwrap().insert(id, rev.chunk_id);
        Ok(handle)
    }

    /// Stages a brand-new row under `id`, to be inserted (into a chunk this
    /// peer owns, creating one if needed) at `prepare_for_commit`. Fails
    /// `Duplicate` if `id` is already available through this cache.
    pub fn insert(&self, id: Hash128, value: V) -> Result<()> {
        if self.has(id) {
            return Err(Error::duplicate(id.to_hex()));
        }
        self.loaded.write().unwrap().insert(id, Arc::new(Mutex::new(value)));
        self.inserted.lock().unwrap().insert(id);
        self.removed.lock().unwrap().remove(&id);
        Ok(())
    }

    /// True if `id` is available through this cache: already materialized,
    /// staged as a new insert, or found by a fresh local lookup. False for
    /// an id staged for removal, regardless of what's still on disk.
    pub fn has(&self, id: Hash128) -> bool {
        if self.removed.lock().unwrap().contains(&id) {
            return false;
        }
        if self.loaded.read().unwrap().contains_key(&id) || self.inserted.lock().unwrap().contains(&id) {
            return true;
        }
        self.table.get_by_id(id, self.at_time).is_ok()
    }

    /// Count of distinct ids `get_all_available_ids` would return.
    pub fn size(&self) -> usize {
        self.get_all_available_ids().len()
    }

    /// Every id visible through this cache: everything locally resident at
    /// `at_time`, plus anything staged as a new insert, minus anything
    /// staged for removal.
    pub fn get_all_available_ids(&self) -> BTreeSet<Hash128> {
        let mut ids: BTreeSet<Hash128> = self.table.dump_active_chunks(self.at_time).unwrap_or_default().into_iter().map(|rev| rev.id).collect();
        ids.extend(self.loaded.read().unwrap().keys().cloned());
        ids.extend(self.inserted.lock().unwrap().iter().cloned());
        let removed = self.removed.lock().unwrap();
        ids.retain(|id| !removed.contains(id));
        ids
    }

    pub fn mark_dirty(&self, id: Hash128) {
        self.dirty.lock().unwrap().insert(id);
    }

    /// Stages a removal of `id`. Cancels a same-transaction `insert` for
    /// `id` outright rather than emitting a tombstone for a row that was
    /// never actually committed.
    pub fn erase(&self, id: Hash128) {
        self.loaded.write().unwrap().remove(&id);
        self.dirty.lock().unwrap().remove(&id);
        self.inserted.lock().unwrap().remove(&id);
        self.removed.lock().unwrap().insert(id);
    }

    /// Folds every staged insert, update, and removal into `txn`. Does not
    /// commit; the caller still calls `txn.commit(...)` (directly, or via
    /// `Transaction::commit` for a cache attached to one).
    pub fn prepare_for_commit(&self, txn: &mut NetTableTransaction) -> Result<()> {
        let removed: Vec<Hash128> = self.removed.lock().unwrap().iter().cloned().collect();
        for id in &removed {
            let chunk_id = match self.chunk_of.lock().unwrap().get(id).copied() {
                Some(c) => c,
                None => match self.table.get_by_id(*id, self.at_time) {
                    Ok(rev) => rev.chunk_id,
                    Err(Error::NotFound { .. }) => continue, // never committed, nothing to remove
                    Err(e) => return Err(e),
                },
            };
            txn.remove(chunk_id, *id, self.at_time)?;
        }

        let inserted: Vec<Hash128> = self.inserted.lock().unwrap().iter().cloned().collect();
        for id in &inserted {
            let handle = self.loaded.read().unwrap().get(id).cloned().ok_or_else(|| Error::not_found(id.to_hex()))?;
            let values = {
                let guard = handle.lock().unwrap();
                (self.to_values)(&guard)
            };
            let chunk_id = txn.insert(values, *id, self.at_time)?;
            self.chunk_of.lock().unwrap().insert(*id, chunk_id);
        }

        let dirty: Vec<Hash128> = self.dirty.lock().unwrap().iter().cloned().collect();
        for id in &dirty {
            if self.inserted.lock().unwrap().contains(id) {
                continue; // already landed as part of the insert above
            }
            let chunk_id = *self.chunk_of.lock().unwrap().get(id).ok_or_else(|| Error::not_found(id.to_hex()))?;
            let handle = self.loaded.read().unwrap().get(id).cloned().ok_or_else(|| Error::not_found(id.to_hex()))?;
            let values = {
                let guard = handle.lock().unwrap();
                (self.to_values)(&guard)
            };
            txn.update(chunk_id, *id, values, self.at_time)?;
        }

        self.dirty.lock().unwrap().clear();
        self.inserted.lock().unwrap().clear();
        self.removed.lock().unwrap().clear();
        Ok(())
    }
}
