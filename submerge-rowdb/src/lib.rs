#![allow(dead_code)]

// The local store: a peer's backing for a single table. Per spec, the
// on-disk record encoding is an external concern (an embedded relational
// store is assumed to exist as an opaque local persistence interface); this
// crate treats `redb` as that opaque engine and only adapts its tables to
// the `LocalStore` operations the rest of the system needs, one `redb`
// table per net-table as described in the wire/persistence section of the
// spec.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use submerge_base::{Error, Hash128, LogicalTime, Result};
use submerge_lang::{FieldValue, TableDescriptor, TableKind};
use submerge_vers::{History, Revision};

#[cfg(test)]
use test_log::test;

/// Operations the core requires of a peer's local, single-table backing
/// store. `at_time` semantics: the latest revision with `update_time <=
/// at_time` and `removed == false`.
pub trait LocalStore {
    fn descriptor(&self) -> &TableDescriptor;
    fn insert(&self, rev: Revision) -> Result<()>;
    fn bulk_insert(&self, revs: Vec<Revision>) -> Result<()>;
    fn update(&self, rev: Revision) -> Result<()>;
    fn patch(&self, rev: Revision) -> Result<()>;
    fn get(&self, id: Hash128, at_time: LogicalTime) -> Result<Revision>;
    fn dump(&self, at_time: LogicalTime) -> Result<Vec<Revision>>;
    fn history(&self, id: Hash128) -> Result<Vec<Revision>>;
    fn find(&self, field: &str, value: &FieldValue, at_time: LogicalTime) -> Result<Vec<Revision>>;
}

/// A `redb`-backed `LocalStore`. One `redb::Database` and one table per
/// net-table, keyed by the revision id's hex `Hash128`, valued by the
/// `rmp_serde`-encoded `History` for that id.
pub struct RedbLocalStore {
    db: Database,
    table: TableDefinition<'static, &'static str, &'static [u8]>,
    descriptor: TableDescriptor,
}

impl RedbLocalStore {
    /// Open (creating if absent) the on-disk database at `path` and ensure
    /// the table for `descriptor` exists.
    pub fn create_table(path: impl AsRef<Path>, descriptor: TableDescriptor) -> Result<Self> {
        let db = Database::create(path)?;
        let name: &'static str = Box::leak(format!("revisions__{}", descriptor.name).into_boxed_str());
        let table = TableDefinition::new(name);
        {
            let txn = db.begin_write()?;
            txn.open_table(table)?;
            txn.commit()?;
        }
        Ok(RedbLocalStore { db, table, descriptor })
    }

    fn load(&self, id: Hash128) -> Result<Option<History>> {
        let txn = self.db.begin_read()?;
        let tbl = txn.open_table(self.table)?;
        match tbl.get(id.to_hex().as_str())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn store(&self, id: Hash128, history: &History) -> Result<()> {
        let bytes = rmp_serde::to_vec(history)?;
        let txn = self.db.begin_write()?;
        {
            let mut tbl = txn.open_table(self.table)?;
            tbl.insert(id.to_hex().as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn new_history(&self, rev: Revision) -> History {
        History::new(self.descriptor.kind, rev)
    }
}

impl LocalStore for RedbLocalStore {
    fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    fn insert(&self, rev: Revision) -> Result<()> {
        if self.load(rev.id)?.is_some() {
            return Err(Error::duplicate(rev.id.to_hex()));
        }
        let history = self.new_history(rev.clone());
        self.store(rev.id, &history)
    }

    fn bulk_insert(&self, revs: Vec<Revision>) -> Result<()> {
        // Check every id is fresh before writing any of them, so the whole
        // batch either lands or none of it does.
        for rev in &revs {
            if self.load(rev.id)?.is_some() {
                return Err(Error::duplicate(rev.id.to_hex()));
            }
        }
        let txn = self.db.begin_write()?;
        {
            let mut tbl = txn.open_table(self.table)?;
            for rev in &revs {
                let history = History::new(self.descriptor.kind, rev.clone());
                let bytes = rmp_serde::to_vec(&history)?;
                tbl.insert(rev.id.to_hex().as_str(), bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn update(&self, rev: Revision) -> Result<()> {
        if matches!(self.descriptor.kind, TableKind::Cr) {
            return Err(Error::invalid("update on a CR table"));
        }
        let mut history = self.load(rev.id)?.ok_or_else(|| Error::not_found(rev.id.to_hex()))?;
        history.push_update(rev.clone())?;
        self.store(rev.id, &history)
    }

    fn patch(&self, rev: Revision) -> Result<()> {
        match self.load(rev.id)? {
            Some(mut history) => {
                history.patch(rev.clone())?;
                self.store(rev.id, &history)
            }
            None => {
                let history = self.new_history(rev.clone());
                self.store(rev.id, &history)
            }
        }
    }

    fn get(&self, id: Hash128, at_time: LogicalTime) -> Result<Revision> {
        let history = self.load(id)?.ok_or_else(|| Error::not_found(id.to_hex()))?;
        history.at_time(at_time).cloned().ok_or_else(|| Error::not_found(id.to_hex()))
    }

    fn dump(&self, at_time: LogicalTime) -> Result<Vec<Revision>> {
        let txn = self.db.begin_read()?;
        let tbl = txn.open_table(self.table)?;
        let mut out = Vec::new();
        for entry in tbl.iter()? {
            let (_, bytes) = entry?;
            let history: History = rmp_serde::from_slice(bytes.value())?;
            if let Some(rev) = history.at_time(at_time) {
                out.push(rev.clone());
            }
        }
        Ok(out)
    }

    fn history(&self, id: Hash128) -> Result<Vec<Revision>> {
        let history = self.load(id)?.ok_or_else(|| Error::not_found(id.to_hex()))?;
        Ok(history.all().into_iter().cloned().collect())
    }

    /// Linear scan over the local table; no secondary index is maintained
    /// locally (the Chord directory is the only distributed index).
    fn find(&self, field: &str, value: &FieldValue, at_time: LogicalTime) -> Result<Vec<Revision>> {
        Ok(self
            .dump(at_time)?
            .into_iter()
            .filter(|rev| rev.get(field).map(|v| v == value).unwrap_or(false))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordered_float::OrderedFloat;
    use submerge_lang::FieldType;

    fn descriptor(kind: TableKind) -> TableDescriptor {
        TableDescriptor::new("t", kind, vec![("n".into(), FieldType::Double)])
    }

    fn rev(id: &str, n: f64, time: u64) -> Revision {
        Revision::from_descriptor(
            &descriptor(TableKind::Cru),
            vec![FieldValue::Double(OrderedFloat(n))],
            Hash128::from_bytes(id.as_bytes()),
            Hash128::from_bytes(b"chunk"),
            LogicalTime(time),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLocalStore::create_table(dir.path().join("t.redb"), descriptor(TableKind::Cru)).unwrap();
        let r = rev("id1", 1.618, 1);
        store.insert(r.clone()).unwrap();
        let got = store.get(r.id, LogicalTime(1)).unwrap();
        assert_eq!(got.get("n").unwrap(), &FieldValue::Double(OrderedFloat(1.618)));
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLocalStore::create_table(dir.path().join("t.redb"), descriptor(TableKind::Cru)).unwrap();
        let r = rev("id1", 1.0, 1);
        store.insert(r.clone()).unwrap();
        assert!(matches!(store.insert(r), Err(Error::Duplicate { .. })));
    }

    #[test]
    fn test_update_then_at_time_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLocalStore::create_table(dir.path().join("t.redb"), descriptor(TableKind::Cru)).unwrap();
        let r0 = rev("id1", 1.0, 1);
        store.insert(r0.clone()).unwrap();
        let mut r1 = r0.next_version();
        r1.set("n", FieldValue::Double(OrderedFloat(7.0))).unwrap();
        r1.stamp_update(LogicalTime(5));
        store.update(r1).unwrap();

        let at_1 = store.get(r0.id, LogicalTime(1)).unwrap();
        assert_eq!(at_1.get("n").unwrap(), &FieldValue::Double(OrderedFloat(1.0)));
        let at_5 = store.get(r0.id, LogicalTime(5)).unwrap();
        assert_eq!(at_5.get("n").unwrap(), &FieldValue::Double(OrderedFloat(7.0)));
    }

    #[test]
    fn test_bulk_insert_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLocalStore::create_table(dir.path().join("t.redb"), descriptor(TableKind::Cru)).unwrap();
        let a = rev("a", 1.0, 1);
        let dup = rev("a", 2.0, 1);
        store.insert(a.clone()).unwrap();
        let b = rev("b", 3.0, 1);
        assert!(store.bulk_insert(vec![b.clone(), dup]).is_err());
        // b must not have been written despite appearing before the conflict.
        assert!(store.get(b.id, LogicalTime(1)).is_err());
    }

    #[test]
    fn test_find_scans_local_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLocalStore::create_table(dir.path().join("t.redb"), descriptor(TableKind::Cru)).unwrap();
        store.insert(rev("a", 1.0, 1)).unwrap();
        store.insert(rev("b", 2.0, 1)).unwrap();
        let found = store.find("n", &FieldValue::Double(OrderedFloat(2.0)), LogicalTime(1)).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_patch_out_of_order_catchup() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbLocalStore::create_table(dir.path().join("t.redb"), descriptor(TableKind::Cru)).unwrap();
        let r5 = rev("a", 5.0, 5);
        store.patch(r5.clone()).unwrap();
        let mut r1 = rev("a", 1.0, 1);
        r1.previous = None;
        store.patch(r1).unwrap();
        assert_eq!(store.history(r5.id).unwrap().len(), 2);
        assert_eq!(store.get(r5.id, LogicalTime(5)).unwrap().get("n").unwrap(), &FieldValue::Double(OrderedFloat(5.0)));
    }
}
