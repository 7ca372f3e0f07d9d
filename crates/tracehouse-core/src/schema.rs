//! Record Schemas
//!
//! A [`Schema`] fixes the arity and field kinds of every record carrying its
//! id, and assigns each field the [`MergeOp`] applied when two accumulators
//! with the same aggregation key meet:
//!
//! ```text
//! Schema 10 "service_metric"
//!   ├── calls    LONG  SUM
//!   ├── latency  LONG  SUM
//!   └── status   INT   COVER
//! ```
//!
//! Schemas are registered once at startup in a [`SchemaRegistry`] and shared
//! read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::record::{Record, Value};
use crate::{Error, Result};

pub type SchemaId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldKind {
    String,
    Int,
    Long,
}

impl FieldKind {
    /// Wire tag used by the record codec.
    pub fn tag(self) -> u8 {
        match self {
            FieldKind::String => 0,
            FieldKind::Int => 1,
            FieldKind::Long => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(FieldKind::String),
            1 => Ok(FieldKind::Int),
            2 => Ok(FieldKind::Long),
            other => Err(Error::Decode(format!("unknown field tag {other}"))),
        }
    }
}

/// How a field combines when an incoming record meets the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOp {
    /// Replace with the latest value.
    Cover,
    /// Add numerically, saturating at the type's max. SUM fields are
    /// non-negative counters, so the merge stays associative.
    Sum,
    /// Keep the first value.
    NonOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub merge: MergeOp,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind, merge: MergeOp) -> Self {
        Self {
            name: name.into(),
            kind,
            merge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    id: SchemaId,
    name: String,
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Build a schema, rejecting SUM on STRING fields and duplicate field names.
    pub fn new(id: SchemaId, name: impl Into<String>, fields: Vec<FieldDef>) -> Result<Self> {
        let name = name.into();
        for (i, field) in fields.iter().enumerate() {
            if field.kind == FieldKind::String && field.merge == MergeOp::Sum {
                return Err(Error::InvalidSchema(format!(
                    "{name}.{}: SUM is not defined for STRING fields",
                    field.name
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::InvalidSchema(format!(
                    "{name}: duplicate field '{}'",
                    field.name
                )));
            }
        }
        Ok(Self { id, name, fields })
    }

    pub fn id(&self) -> SchemaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Position of the named field, if present.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Check that `record` carries this schema's id, arity and field kinds.
    pub fn validate(&self, record: &Record) -> Result<()> {
        if record.schema_id != self.id {
            return Err(Error::SchemaMismatch(format!(
                "record schema {} does not match schema {} ({})",
                record.schema_id, self.id, self.name
            )));
        }
        if record.values.len() != self.fields.len() {
            return Err(Error::SchemaMismatch(format!(
                "{}: expected {} fields, got {}",
                self.name,
                self.fields.len(),
                record.values.len()
            )));
        }
        for (field, value) in self.fields.iter().zip(&record.values) {
            if field.kind != value.kind() {
                return Err(Error::SchemaMismatch(format!(
                    "{}.{}: expected {:?}, got {:?}",
                    self.name,
                    field.name,
                    field.kind,
                    value.kind()
                )));
            }
            if field.merge == MergeOp::Sum && value.is_negative() {
                return Err(Error::SchemaMismatch(format!(
                    "{}.{}: SUM field must not be negative",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }

    /// Merge `incoming` onto `acc` field by field.
    ///
    /// Both records must already be valid for this schema.
    pub fn merge(&self, acc: &mut Record, incoming: &Record) -> Result<()> {
        self.validate(acc)?;
        self.validate(incoming)?;

        for ((field, slot), value) in self
            .fields
            .iter()
            .zip(acc.values.iter_mut())
            .zip(&incoming.values)
        {
            match field.merge {
                MergeOp::Cover => *slot = value.clone(),
                MergeOp::NonOp => {}
                MergeOp::Sum => match (slot, value) {
                    (Value::Int(a), Value::Int(b)) => *a = a.saturating_add(*b),
                    (Value::Long(a), Value::Long(b)) => *a = a.saturating_add(*b),
                    _ => {
                        return Err(Error::SchemaMismatch(format!(
                            "{}.{}: SUM over non-numeric value",
                            self.name, field.name
                        )))
                    }
                },
            }
        }
        Ok(())
    }
}

/// Schema id → schema, filled at startup and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<SchemaId, Arc<Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: Schema) -> Result<Arc<Schema>> {
        if self.schemas.contains_key(&schema.id) {
            return Err(Error::InvalidSchema(format!(
                "schema id {} registered twice",
                schema.id
            )));
        }
        let schema = Arc::new(schema);
        self.schemas.insert(schema.id, Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get(&self, id: SchemaId) -> Result<&Arc<Schema>> {
        self.schemas.get(&id).ok_or(Error::UnknownSchema(id))
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric_schema() -> Schema {
        Schema::new(
            10,
            "service_metric",
            vec![
                FieldDef::new("calls", FieldKind::Long, MergeOp::Sum),
                FieldDef::new("status", FieldKind::Int, MergeOp::Cover),
                FieldDef::new("first_seen", FieldKind::String, MergeOp::NonOp),
            ],
        )
        .unwrap()
    }

    fn record(calls: i64, status: i32, first: &str) -> Record {
        Record::new(
            10,
            "svc-a",
            1,
            vec![
                Value::Long(calls),
                Value::Int(status),
                Value::Str(first.to_string()),
            ],
        )
    }

    #[test]
    fn test_sum_on_string_is_rejected() {
        let err = Schema::new(
            1,
            "bad",
            vec![FieldDef::new("name", FieldKind::String, MergeOp::Sum)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSchema(_)));
    }

    #[test]
    fn test_duplicate_field_is_rejected() {
        let err = Schema::new(
            1,
            "bad",
            vec![
                FieldDef::new("a", FieldKind::Int, MergeOp::Sum),
                FieldDef::new("a", FieldKind::Long, MergeOp::Sum),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSchema(_)));
    }

    #[test]
    fn test_merge_ops() {
        let schema = metric_schema();
        let mut acc = record(5, 200, "first");
        schema.merge(&mut acc, &record(7, 500, "second")).unwrap();

        assert_eq!(acc.values[0], Value::Long(12));
        assert_eq!(acc.values[1], Value::Int(500));
        assert_eq!(acc.values[2], Value::Str("first".to_string()));
    }

    #[test]
    fn test_sum_saturates() {
        let schema = metric_schema();
        let mut acc = record(i64::MAX - 1, 0, "");
        schema.merge(&mut acc, &record(10, 0, "")).unwrap();
        assert_eq!(acc.values[0], Value::Long(i64::MAX));
    }

    #[test]
    fn test_negative_sum_is_rejected() {
        let schema = metric_schema();
        let err = schema.validate(&record(-1, 0, "")).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));

        // cover fields may go negative
        assert!(schema.validate(&record(1, -1, "")).is_ok());
        let mut acc = record(1, 0, "");
        assert!(schema.merge(&mut acc, &record(-1, 0, "")).is_err());
        assert_eq!(acc.values[0], Value::Long(1));
    }

    #[test]
    fn test_saturating_sum_is_associative() {
        let schema = metric_schema();
        let (a, b, c) = (record(i64::MAX - 1, 0, ""), record(5, 0, ""), record(3, 0, ""));

        let mut left = a.clone();
        schema.merge(&mut left, &b).unwrap();
        schema.merge(&mut left, &c).unwrap();

        let mut tail = b.clone();
        schema.merge(&mut tail, &c).unwrap();
        let mut right = a;
        schema.merge(&mut right, &tail).unwrap();

        assert_eq!(left.values[0], right.values[0]);
        assert_eq!(left.values[0], Value::Long(i64::MAX));
    }

    #[test]
    fn test_validate_arity_and_kind() {
        let schema = metric_schema();

        let short = Record::new(10, "svc-a", 1, vec![Value::Long(1)]);
        assert!(matches!(schema.validate(&short), Err(Error::SchemaMismatch(_))));

        let wrong_kind = Record::new(
            10,
            "svc-a",
            1,
            vec![Value::Int(1), Value::Int(1), Value::Str(String::new())],
        );
        assert!(matches!(
            schema.validate(&wrong_kind),
            Err(Error::SchemaMismatch(_))
        ));

        let other_schema = Record::new(11, "svc-a", 1, record(1, 1, "").values);
        assert!(schema.validate(&other_schema).is_err());
    }

    #[test]
    fn test_registry_rejects_duplicate_id() {
        let mut registry = SchemaRegistry::new();
        registry.register(metric_schema()).unwrap();
        assert!(registry.register(metric_schema()).is_err());
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.get(99), Err(Error::UnknownSchema(99))));
    }
}
