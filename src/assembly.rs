//! # Typed Record Assembly
//!
//! A tag-indexed registry that gives every wire record a fully qualified
//! type name and a codec, so that payloads are self-describing: an
//! intermediate node can re-emit records it does not semantically
//! understand, while endpoints register additional types at startup
//! without touching this module.
//!
//! ## Encoded form
//!
//! Each record becomes a JSON object carrying a `_type` discriminator
//! plus its named fields. Nested structures use the record's own serde
//! representation. Date-like values are written as `YYYY-MM-DD HH:MM:SS`
//! and compiled patterns by their source text; records opt in through the
//! [`datetime_format`] and [`pattern_format`] serde helpers.
//!
//! ## Failure policy
//!
//! [`decode_value`] reports an [`AssemblyError`] per record. [`loads`]
//! applies the recovery policy: a record with an unregistered `_type` or
//! mismatched fields is logged and skipped, the rest of the document is
//! still delivered.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Decoding faults reported per record.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// The `_type` discriminator names a type nobody registered.
    #[error("type '{0}' not recognised")]
    UnknownType(String),

    /// The record's fields do not match the registered declaration.
    #[error("field mismatch against {0}")]
    FieldMismatch(String),

    /// The object carries no `_type` discriminator at all.
    #[error("item bears no _type discriminator")]
    Untagged,

    /// The document is not parseable text.
    #[error("malformed document: {0}")]
    Syntax(#[from] serde_json::Error),
}

/// A value that knows its registered type name and its encoded fields.
///
/// Implemented for free by every [`Record`]; consumers recover concrete
/// types with [`downcast`].
pub trait Tagged: std::fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;

    /// The record's named fields, without the `_type` discriminator.
    fn to_value(&self) -> Value;

    fn as_any(&self) -> &dyn Any;

    fn clone_tagged(&self) -> Item;
}

/// An owned payload record of any registered type.
pub type Item = Box<dyn Tagged>;

impl Clone for Item {
    fn clone(&self) -> Self {
        self.clone_tagged()
    }
}

// Equality by discriminator and encoded fields; boxes inherit it.
impl PartialEq for dyn Tagged {
    fn eq(&self, other: &Self) -> bool {
        self.type_name() == other.type_name() && self.to_value() == other.to_value()
    }
}

/// A concrete record type that can join the catalogue.
///
/// The serde derive supplies the field codec; `TYPE_NAME` is the wire
/// discriminator. Types should reject unknown fields so that a field
/// mismatch is caught rather than silently dropped.
pub trait Record:
    std::fmt::Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const TYPE_NAME: &'static str;
}

impl<T: Record> Tagged for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_tagged(&self) -> Item {
        Box::new(self.clone())
    }
}

/// Recover a concrete record from a payload item.
pub fn downcast<T: Record>(item: &Item) -> Option<&T> {
    item.as_any().downcast_ref::<T>()
}

struct Codec {
    decode: fn(Value) -> Result<Item, AssemblyError>,
}

fn decode_as<T: Record>(value: Value) -> Result<Item, AssemblyError> {
    match serde_json::from_value::<T>(value) {
        Ok(record) => Ok(Box::new(record)),
        Err(_) => Err(AssemblyError::FieldMismatch(T::TYPE_NAME.to_string())),
    }
}

fn catalogue() -> &'static RwLock<HashMap<String, Codec>> {
    static CATALOGUE: OnceLock<RwLock<HashMap<String, Codec>>> = OnceLock::new();
    CATALOGUE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Add a record type to the process-wide catalogue.
///
/// Registration belongs to the initialization phase; the catalogue is
/// write-once in spirit and re-registering a name is a no-op.
pub fn register<T: Record>() {
    let mut types = catalogue().write().expect("assembly catalogue poisoned");
    types
        .entry(T::TYPE_NAME.to_string())
        .or_insert(Codec { decode: decode_as::<T> });
}

/// True when the discriminator names a registered type.
pub fn is_registered(name: &str) -> bool {
    catalogue()
        .read()
        .expect("assembly catalogue poisoned")
        .contains_key(name)
}

/// The item's fields as an object with the `_type` discriminator added.
pub fn tagged_value(item: &dyn Tagged) -> Value {
    let mut value = item.to_value();
    if let Value::Object(ref mut fields) = value {
        fields.insert("_type".to_string(), Value::String(item.type_name().to_string()));
    }
    value
}

/// Produce the canonical textual encoding of a sequence of records.
pub fn dumps(items: &[Item]) -> String {
    let doc: Vec<Value> = items.iter().map(|i| tagged_value(i.as_ref())).collect();
    serde_json::to_string(&doc).unwrap_or_else(|_| "[]".to_string())
}

/// Decode one tagged object into a registered record.
pub fn decode_value(value: Value) -> Result<Item, AssemblyError> {
    let Value::Object(mut fields) = value else {
        return Err(AssemblyError::Untagged);
    };
    let name = match fields.remove("_type") {
        Some(Value::String(name)) => name,
        _ => return Err(AssemblyError::Untagged),
    };
    let types = catalogue().read().expect("assembly catalogue poisoned");
    let codec = types
        .get(&name)
        .ok_or(AssemblyError::UnknownType(name))?;
    (codec.decode)(Value::Object(fields))
}

/// Parse a document into registered records.
///
/// The text may hold a single tagged object or an array of them.
/// Undecodable records are logged and skipped; only unparseable text
/// fails the whole call.
pub fn loads(text: &str) -> Result<Vec<Item>, AssemblyError> {
    let doc: Value = serde_json::from_str(text)?;
    let entries = match doc {
        Value::Array(entries) => entries,
        other => vec![other],
    };

    let mut items = Vec::with_capacity(entries.len());
    for (n, entry) in entries.into_iter().enumerate() {
        match decode_value(entry) {
            Ok(item) => items.push(item),
            Err(fault) => warn!("no load of item {}: {}", n + 1, fault),
        }
    }
    Ok(items)
}

/// Serde helper for date-like fields: `YYYY-MM-DD HH:MM:SS`.
pub mod datetime_format {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for compiled patterns, encoded by their source text.
pub mod pattern_format {
    use regex::Regex;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pattern: &Regex, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(pattern.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Regex, D::Error> {
        let text = String::deserialize(deserializer)?;
        Regex::new(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Probe {
        label: String,
        count: u32,
    }

    impl Record for Probe {
        const TYPE_NAME: &'static str = "ipc.fabric.test.Probe";
    }

    fn item(label: &str, count: u32) -> Item {
        Box::new(Probe {
            label: label.to_string(),
            count,
        })
    }

    #[test]
    fn test_round_trip() {
        register::<Probe>();
        let original = vec![item("a", 1), item("b", 2)];
        let text = dumps(&original);
        let decoded = loads(&text).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_unknown_type_is_reported() {
        register::<Probe>();
        let value: Value =
            serde_json::from_str(r#"{"_type": "ipc.fabric.test.Bogus", "label": "a"}"#).unwrap();
        match decode_value(value) {
            Err(AssemblyError::UnknownType(name)) => {
                assert_eq!(name, "ipc.fabric.test.Bogus")
            }
            other => panic!("expected UnknownType, got {:?}", other.map(|i| i.type_name())),
        }
    }

    #[test]
    fn test_field_mismatch_is_reported() {
        register::<Probe>();
        let value: Value = serde_json::from_str(
            r#"{"_type": "ipc.fabric.test.Probe", "label": "a", "count": 1, "bogus": true}"#,
        )
        .unwrap();
        assert!(matches!(
            decode_value(value),
            Err(AssemblyError::FieldMismatch(_))
        ));
    }

    #[test]
    fn test_loads_skips_undecodable_records() {
        register::<Probe>();
        let text = concat!(
            r#"[{"_type": "ipc.fabric.test.Probe", "label": "a", "count": 1},"#,
            r#" {"_type": "ipc.fabric.test.Missing", "x": 0},"#,
            r#" {"_type": "ipc.fabric.test.Probe", "label": "b", "count": 2}]"#,
        );
        let decoded = loads(text).unwrap();
        assert_eq!(decoded, vec![item("a", 1), item("b", 2)]);
    }

    #[test]
    fn test_loads_rejects_malformed_text() {
        assert!(matches!(
            loads("{not json"),
            Err(AssemblyError::Syntax(_))
        ));
    }
}
