#![allow(dead_code)]

// The field type system shared by every revision in every table: one tagged
// union of values (`FieldValue`), one type tag per variant (`FieldType`), and
// a descriptor (`TableDescriptor`) that names and orders the fields a table's
// revisions carry. This replaces a family of per-field-type macro-generated
// getters/setters with a single generic `get`/`set` path (see submerge-vers).

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use submerge_base::{Error, Result};

#[cfg(test)]
use test_log::test;

/// The type of a single field, independent of its value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Blob,
    Double,
    Hash128,
    Int32,
    Uint32,
    Int64,
    Uint64,
    String,
    Bool,
}

/// A field's value, tagged by its own variant rather than carrying a
/// separate type byte alongside an untyped payload.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Blob(Vec<u8>),
    Double(OrderedFloat<f64>),
    Hash128(submerge_base::Hash128),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    String(String),
    Bool(bool),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Blob(_) => FieldType::Blob,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Hash128(_) => FieldType::Hash128,
            FieldValue::Int32(_) => FieldType::Int32,
            FieldValue::Uint32(_) => FieldType::Uint32,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::Uint64(_) => FieldType::Uint64,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Bool(_) => FieldType::Bool,
        }
    }

    pub fn matches_type(&self, ty: FieldType) -> bool {
        self.field_type() == ty
    }
}

/// Whether a table is append-only (CR) or supports update + logical delete
/// (CRU).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum TableKind {
    Cr,
    Cru,
}

/// The schema of a table: an ordered list of named, typed fields. Two
/// revisions are structure-equal iff their owning descriptors' field names,
/// in this order, are identical (system fields are not part of the
/// descriptor; they're implicit on every revision).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub kind: TableKind,
    pub fields: Vec<(String, FieldType)>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, kind: TableKind, fields: Vec<(String, FieldType)>) -> Self {
        TableDescriptor { name: name.into(), kind, fields }
    }

    pub fn field_type(&self, name: &str) -> Result<FieldType> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
            .ok_or_else(|| Error::unknown_field(name))
    }

    /// Field names, in descriptor order; this is the ordering
    /// `structure_match` compares by.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn structure_match(&self, other: &TableDescriptor) -> bool {
        self.field_names().eq(other.field_names())
    }
}

#[test]
fn test_field_value_type_tag() {
    let v = FieldValue::Double(OrderedFloat(3.14));
    assert_eq!(v.field_type(), FieldType::Double);
    assert!(v.matches_type(FieldType::Double));
    assert!(!v.matches_type(FieldType::Int64));
}

#[test]
fn test_descriptor_structure_match_is_ordered() {
    let a = TableDescriptor::new(
        "t",
        TableKind::Cru,
        vec![("n".into(), FieldType::Double), ("m".into(), FieldType::Int64)],
    );
    let b = TableDescriptor::new(
        "t",
        TableKind::Cru,
        vec![("m".into(), FieldType::Int64), ("n".into(), FieldType::Double)],
    );
    assert!(!a.structure_match(&b), "reordered fields must not structure-match");
    assert!(a.structure_match(&a.clone()));
}

#[test]
fn test_descriptor_field_type_lookup() {
    let d = TableDescriptor::new("t", TableKind::Cr, vec![("n".into(), FieldType::Double)]);
    assert_eq!(d.field_type("n").unwrap(), FieldType::Double);
    assert!(d.field_type("missing").is_err());
}
