#![allow(dead_code)]

// Versioning, history, provenance: the typed, versioned record (`Revision`)
// and its per-id history (`History`). A revision is immutable once inserted;
// an update is produced by cloning it, mutating the clone, and handing it
// back to the owning chunk to commit (see submerge-net::chunk).

use serde::{Deserialize, Serialize};
use submerge_base::{Error, Hash128, LogicalTime, Result};
use submerge_lang::{FieldType, FieldValue, TableDescriptor, TableKind};

#[cfg(test)]
use test_log::test;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct FieldSlot {
    name: String,
    ty: FieldType,
    value: FieldValue,
}

/// Identifies a specific version of a specific id, e.g. the `previous`
/// pointer on an updated revision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub id: Hash128,
    pub update_time: LogicalTime,
}

/// A single typed, versioned record. The `id` and `chunk_id` never change
/// after the first insert; `update_time` strictly increases along a given
/// id's history, and `insert_time < update_time` on the first update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    fields: Vec<FieldSlot>,
    pub id: Hash128,
    pub chunk_id: Hash128,
    pub insert_time: LogicalTime,
    pub update_time: LogicalTime,
    pub removed: bool,
    pub previous: Option<RevisionRef>,
}

impl Revision {
    /// Build a brand-new revision (not yet inserted) from a descriptor and
    /// the values for its fields, in descriptor order.
    pub fn from_descriptor(
        descriptor: &TableDescriptor,
        values: Vec<FieldValue>,
        id: Hash128,
        chunk_id: Hash128,
        insert_time: LogicalTime,
    ) -> Result<Revision> {
        if values.len() != descriptor.fields.len() {
            return Err(Error::invalid(format!(
                "expected {} field values, got {}",
                descriptor.fields.len(),
                values.len()
            )));
        }
        let mut fields = Vec::with_capacity(values.len());
        for ((name, ty), value) in descriptor.fields.iter().zip(values.into_iter()) {
            if !value.matches_type(*ty) {
                return Err(Error::schema_mismatch(format!("{ty:?}"), format!("{:?}", value.field_type())));
            }
            fields.push(FieldSlot { name: name.clone(), ty: *ty, value });
        }
        Ok(Revision {
            fields,
            id,
            chunk_id,
            insert_time,
            update_time: insert_time,
            removed: false,
            previous: None,
        })
    }

    pub fn get(&self, name: &str) -> Result<&FieldValue> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
            .ok_or_else(|| Error::unknown_field(name))
    }

    pub fn set(&mut self, name: &str, value: FieldValue) -> Result<()> {
        let slot = self.fields.iter_mut().find(|f| f.name == name).ok_or_else(|| Error::unknown_field(name))?;
        if !value.matches_type(slot.ty) {
            return Err(Error::schema_mismatch(format!("{:?}", slot.ty), format!("{:?}", value.field_type())));
        }
        slot.value = value;
        Ok(())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Two revisions are structure-equal if their field names, in order,
    /// are identical.
    pub fn structure_match(&self, other: &Revision) -> bool {
        self.field_names().eq(other.field_names())
    }

    pub fn field_equal(&self, other: &Revision, name: &str) -> Result<bool> {
        Ok(self.get(name)? == other.get(name)?)
    }

    /// Field-by-field comparison of user data, ignoring system fields
    /// (`update_time` in particular, since it's assigned at commit time and
    /// isn't meaningful to compare when deciding whether an object changed).
    pub fn equal(&self, other: &Revision) -> bool {
        self.structure_match(other) && self.fields.iter().zip(other.fields.iter()).all(|(a, b)| a.value == b.value)
    }

    /// Clone this revision as the basis for an update: same id/chunk_id and
    /// fields, `previous` set to this version. The owning chunk stamps the
    /// new `update_time` when it commits the update under its write lock.
    pub fn next_version(&self) -> Revision {
        let mut next = self.clone();
        next.previous = Some(RevisionRef { id: self.id, update_time: self.update_time });
        next
    }

    pub fn stamp_update(&mut self, t: LogicalTime) {
        self.update_time = t;
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Revision> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// The set of versions of one id. CR tables keep only the current revision;
/// CRU tables keep every version, latest-first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum History {
    Cr(Revision),
    Cru(Vec<Revision>),
}

impl History {
    pub fn new(kind: TableKind, rev: Revision) -> History {
        match kind {
            TableKind::Cr => History::Cr(rev),
            TableKind::Cru => History::Cru(vec![rev]),
        }
    }

    pub fn latest(&self) -> &Revision {
        match self {
            History::Cr(r) => r,
            History::Cru(vs) => &vs[0],
        }
    }

    /// The latest revision with `update_time <= at_time` and `removed ==
    /// false`, or `None` if no such version exists (e.g. all versions are
    /// newer than `at_time`, or the latest such version was removed).
    pub fn at_time(&self, at_time: LogicalTime) -> Option<&Revision> {
        match self {
            History::Cr(r) => (r.insert_time <= at_time).then_some(r),
            History::Cru(vs) => vs.iter().find(|r| r.update_time <= at_time).filter(|r| !r.removed),
        }
    }

    /// Append a new version. Fails `Invalid` if `update_time` does not
    /// strictly increase, preserving the append-only-history invariant (P2).
    pub fn push_update(&mut self, rev: Revision) -> Result<()> {
        match self {
            History::Cr(_) => Err(Error::invalid("update on a CR table")),
            History::Cru(vs) => {
                if rev.update_time <= vs[0].update_time {
                    return Err(Error::invalid("update_time does not strictly increase"));
                }
                vs.insert(0, rev);
                Ok(())
            }
        }
    }

    /// Force-write a history entry at a specific position, used when
    /// catching up from a swarm peer (`patch`, see submerge-rowdb). Inserts
    /// in `update_time` order and rejects a position already occupied by a
    /// different version.
    pub fn patch(&mut self, rev: Revision) -> Result<()> {
        match self {
            History::Cr(r) => {
                *r = rev;
                Ok(())
            }
            History::Cru(vs) => {
                if let Some(existing) = vs.iter().position(|v| v.update_time == rev.update_time) {
                    vs[existing] = rev;
                } else {
                    let pos = vs.iter().position(|v| v.update_time < rev.update_time).unwrap_or(vs.len());
                    vs.insert(pos, rev);
                }
                Ok(())
            }
        }
    }

    pub fn all(&self) -> Vec<&Revision> {
        match self {
            History::Cr(r) => vec![r],
            History::Cru(vs) => vs.iter().collect(),
        }
    }
}

#[cfg(test)]
fn test_descriptor() -> TableDescriptor {
    TableDescriptor::new("t", TableKind::Cru, vec![("n".into(), FieldType::Double)])
}

#[test]
fn test_set_wrong_type_is_schema_mismatch() {
    let d = test_descriptor();
    let mut rev = Revision::from_descriptor(
        &d,
        vec![FieldValue::Double(ordered_float::OrderedFloat(1.618))],
        Hash128::from_bytes(b"id1"),
        Hash128::from_bytes(b"chunk1"),
        LogicalTime(1),
    )
    .unwrap();
    assert!(matches!(rev.set("n", FieldValue::Int64(3)), Err(Error::SchemaMismatch { .. })));
    assert!(rev.set("n", FieldValue::Double(ordered_float::OrderedFloat(7.0))).is_ok());
}

#[test]
fn test_get_unknown_field() {
    let d = test_descriptor();
    let rev = Revision::from_descriptor(
        &d,
        vec![FieldValue::Double(ordered_float::OrderedFloat(1.0))],
        Hash128::from_bytes(b"id1"),
        Hash128::from_bytes(b"chunk1"),
        LogicalTime(1),
    )
    .unwrap();
    assert!(matches!(rev.get("missing"), Err(Error::UnknownField { .. })));
}

#[test]
fn test_history_append_only_strictly_increasing() {
    let d = test_descriptor();
    let v0 = Revision::from_descriptor(
        &d,
        vec![FieldValue::Double(ordered_float::OrderedFloat(1.0))],
        Hash128::from_bytes(b"id1"),
        Hash128::from_bytes(b"chunk1"),
        LogicalTime(1),
    )
    .unwrap();
    let mut hist = History::new(TableKind::Cru, v0.clone());
    let mut v1 = v0.next_version();
    v1.stamp_update(LogicalTime(2));
    hist.push_update(v1.clone()).unwrap();
    assert_eq!(hist.latest().update_time, LogicalTime(2));

    let mut stale = v0.next_version();
    stale.stamp_update(LogicalTime(2));
    assert!(hist.push_update(stale).is_err());
}

#[test]
fn test_history_at_time_skips_removed() {
    let d = test_descriptor();
    let v0 = Revision::from_descriptor(
        &d,
        vec![FieldValue::Double(ordered_float::OrderedFloat(1.0))],
        Hash128::from_bytes(b"id1"),
        Hash128::from_bytes(b"chunk1"),
        LogicalTime(1),
    )
    .unwrap();
    let mut hist = History::new(TableKind::Cru, v0.clone());
    let mut removed = v0.next_version();
    removed.stamp_update(LogicalTime(2));
    removed.removed = true;
    hist.push_update(removed).unwrap();

    assert!(hist.at_time(LogicalTime(2)).is_none());
    assert_eq!(hist.at_time(LogicalTime(1)).unwrap().update_time, LogicalTime(1));
}

#[test]
fn test_serialize_roundtrip() {
    let d = test_descriptor();
    let rev = Revision::from_descriptor(
        &d,
        vec![FieldValue::Double(ordered_float::OrderedFloat(2.5))],
        Hash128::from_bytes(b"id1"),
        Hash128::from_bytes(b"chunk1"),
        LogicalTime(1),
    )
    .unwrap();
    let bytes = rev.serialize().unwrap();
    let back = Revision::parse(&bytes).unwrap();
    assert!(rev.equal(&back));
    assert_eq!(rev.id, back.id);
}
