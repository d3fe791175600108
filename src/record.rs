//! Records and Type Descriptors
//!
//! A record is a typed bag of named [`TupleValue`] fields with a primary
//! key drawn from declared key fields. [`RecordType`] is the only
//! abstraction the engine has over a record type: field enumeration,
//! value extraction by name, and key-path resolution. The codec keeps the
//! payload format erased at the storage boundary.

use crate::error::{Error, Result};
use crate::tuple::{Tuple, TupleValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable descriptor of a registered record type.
#[derive(Debug, Clone)]
pub struct RecordType {
    name: String,
    fields: Vec<String>,
    key_fields: Vec<String>,
    /// Fields excluded from covering-index projection checks
    non_projectable: Vec<String>,
}

impl RecordType {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<&str>,
        key_fields: Vec<&str>,
    ) -> Self {
        RecordType {
            name: name.into(),
            fields: fields.into_iter().map(String::from).collect(),
            key_fields: key_fields.into_iter().map(String::from).collect(),
            non_projectable: Vec::new(),
        }
    }

    pub fn with_non_projectable(mut self, fields: Vec<&str>) -> Self {
        self.non_projectable = fields.into_iter().map(String::from).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enumerate the declared field names.
    pub fn field_names(&self) -> &[String] {
        &self.fields
    }

    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    pub fn non_projectable(&self) -> &[String] {
        &self.non_projectable
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }

    /// Map a key-path token to a field name. Tokens map 1:1 onto field
    /// names; unknown tokens error.
    pub fn resolve_key_path<'a>(&self, token: &'a str) -> Result<&'a str> {
        if self.has_field(token) {
            Ok(token)
        } else {
            Err(Error::UnknownField {
                record_type: self.name.clone(),
                field: token.to_string(),
            })
        }
    }

    /// Extract a field value from a record. Absent fields read as null.
    pub fn field_value<'a>(&self, record: &'a DynRecord, name: &str) -> Result<&'a TupleValue> {
        if !self.has_field(name) {
            return Err(Error::UnknownField {
                record_type: self.name.clone(),
                field: name.to_string(),
            });
        }
        Ok(record.values.get(name).unwrap_or(&TupleValue::Null))
    }

    /// Primary key tuple of a record under this type.
    pub fn primary_key(&self, record: &DynRecord) -> Result<Tuple> {
        let mut key = Tuple::empty();
        for field in &self.key_fields {
            let value = self.field_value(record, field)?;
            if value.is_null() {
                return Err(Error::InvalidQuery(format!(
                    "primary key field '{field}' of '{}' is null",
                    self.name
                )));
            }
            key.push(value.clone());
        }
        Ok(key)
    }
}

/// The erased record used at the storage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DynRecord {
    type_name: String,
    values: BTreeMap<String, TupleValue>,
}

impl DynRecord {
    pub fn new(type_name: impl Into<String>) -> Self {
        DynRecord {
            type_name: type_name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<TupleValue>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, field: &str) -> Option<&TupleValue> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<TupleValue>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &TupleValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Record payload codec: length-prefixed, field-tagged under the hood.
pub trait RecordCodec: Send + Sync {
    fn encode(&self, record: &DynRecord) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<DynRecord>;
}

/// Default codec backed by bincode.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl RecordCodec for BincodeCodec {
    fn encode(&self, record: &DynRecord) -> Result<Vec<u8>> {
        bincode::serialize(record).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynRecord> {
        bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Registry of record types known to the engine. Cloning shares the
/// underlying table, so late registrations are visible everywhere.
#[derive(Default, Clone)]
pub struct RecordRegistry {
    types: Arc<parking_lot::RwLock<HashMap<String, Arc<RecordType>>>>,
}

impl RecordRegistry {
    pub fn new() -> Self {
        RecordRegistry::default()
    }

    pub fn register(&self, record_type: RecordType) -> Arc<RecordType> {
        let arc = Arc::new(record_type);
        self.types
            .write()
            .insert(arc.name().to_string(), Arc::clone(&arc));
        arc
    }

    pub fn get(&self, name: &str) -> Result<Arc<RecordType>> {
        self.types
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownRecordType(name.to_string()))
    }

    pub fn type_names(&self) -> Vec<String> {
        self.types.read().keys().cloned().collect()
    }

    /// Validate that a record only carries declared fields.
    pub fn validate(&self, record: &DynRecord) -> Result<()> {
        let ty = self.get(record.type_name())?;
        for (field, _) in record.fields() {
            if !ty.has_field(field) {
                return Err(Error::UnknownField {
                    record_type: ty.name().to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}
