//! Entity model: typed property values and the two-part entity identity.
//!
//! Property values are a closed set of EDM kinds. The wire form is OData
//! JSON, where kinds the service cannot infer carry a `Name@odata.type`
//! annotation next to the value (Int64 travels as a string, Binary as
//! base64, DateTime as RFC 3339).

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, TableError};

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum EdmValue {
    String(String),
    Double(f64),
    Int64(i64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Binary(Bytes),
    Guid(Uuid),
}

impl EdmValue {
    /// The OData type annotation for this kind, if the service needs one.
    /// String and Boolean are inferable from the JSON value itself.
    pub fn edm_type(&self) -> Option<&'static str> {
        match self {
            EdmValue::String(_) | EdmValue::Boolean(_) => None,
            EdmValue::Double(_) => Some("Edm.Double"),
            EdmValue::Int64(_) => Some("Edm.Int64"),
            EdmValue::DateTime(_) => Some("Edm.DateTime"),
            EdmValue::Binary(_) => Some("Edm.Binary"),
            EdmValue::Guid(_) => Some("Edm.Guid"),
        }
    }

    fn to_wire(&self) -> Value {
        match self {
            EdmValue::String(s) => Value::String(s.clone()),
            // Doubles ride as JSON numbers; Int64 exceeds the interoperable
            // integer range so the service expects it as a string.
            EdmValue::Double(d) => Value::from(*d),
            EdmValue::Int64(i) => Value::String(i.to_string()),
            EdmValue::Boolean(b) => Value::Bool(*b),
            EdmValue::DateTime(t) => {
                Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            EdmValue::Binary(b) => Value::String(BASE64.encode(b)),
            EdmValue::Guid(g) => Value::String(g.to_string()),
        }
    }

    fn from_wire(name: &str, value: &Value, annotation: Option<&str>) -> Result<Self> {
        let type_err = |detail: &str| {
            TableError::Validation(format!("property {}: {}", name, detail))
        };

        match annotation {
            Some("Edm.String") | None => match value {
                Value::String(s) => Ok(EdmValue::String(s.clone())),
                Value::Bool(b) => Ok(EdmValue::Boolean(*b)),
                Value::Number(n) => {
                    // Unannotated integers are the service's Int32 default;
                    // fold them into the Int64 kind.
                    if let Some(i) = n.as_i64() {
                        Ok(EdmValue::Int64(i))
                    } else if let Some(d) = n.as_f64() {
                        Ok(EdmValue::Double(d))
                    } else {
                        Err(type_err("number out of range"))
                    }
                }
                _ => Err(type_err("unsupported JSON value")),
            },
            Some("Edm.Boolean") => match value {
                Value::Bool(b) => Ok(EdmValue::Boolean(*b)),
                _ => Err(type_err("expected boolean")),
            },
            Some("Edm.Double") => match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(EdmValue::Double)
                    .ok_or_else(|| type_err("expected double")),
                Value::String(s) => s
                    .parse::<f64>()
                    .map(EdmValue::Double)
                    .map_err(|_| type_err("malformed double")),
                _ => Err(type_err("expected double")),
            },
            Some("Edm.Int64") => match value {
                Value::String(s) => s
                    .parse::<i64>()
                    .map(EdmValue::Int64)
                    .map_err(|_| type_err("malformed Int64")),
                Value::Number(n) => n
                    .as_i64()
                    .map(EdmValue::Int64)
                    .ok_or_else(|| type_err("Int64 out of range")),
                _ => Err(type_err("expected Int64")),
            },
            Some("Edm.DateTime") => match value {
                Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|t| EdmValue::DateTime(t.with_timezone(&Utc)))
                    .map_err(|_| type_err("malformed DateTime")),
                _ => Err(type_err("expected DateTime")),
            },
            Some("Edm.Binary") => match value {
                Value::String(s) => BASE64
                    .decode(s)
                    .map(|b| EdmValue::Binary(Bytes::from(b)))
                    .map_err(|_| type_err("malformed base64")),
                _ => Err(type_err("expected Binary")),
            },
            Some("Edm.Guid") => match value {
                Value::String(s) => Uuid::parse_str(s)
                    .map(EdmValue::Guid)
                    .map_err(|_| type_err("malformed Guid")),
                _ => Err(type_err("expected Guid")),
            },
            Some(other) => Err(type_err(&format!("unknown EDM kind {}", other))),
        }
    }
}

impl fmt::Display for EdmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdmValue::String(s) => write!(f, "{}", s),
            EdmValue::Double(d) => write!(f, "{}", d),
            EdmValue::Int64(i) => write!(f, "{}", i),
            EdmValue::Boolean(b) => write!(f, "{}", b),
            EdmValue::DateTime(t) => {
                write!(f, "{}", t.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            EdmValue::Binary(b) => write!(f, "{}", BASE64.encode(b)),
            EdmValue::Guid(g) => write!(f, "{}", g),
        }
    }
}

/// A table entity: immutable (PartitionKey, RowKey) identity plus a map of
/// named, typed properties.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntity {
    partition_key: String,
    row_key: String,
    properties: BTreeMap<String, EdmValue>,
}

impl TableEntity {
    /// Create an entity with the given identity. Both keys must be non-empty.
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Result<Self> {
        let partition_key = partition_key.into();
        let row_key = row_key.into();

        if partition_key.is_empty() {
            return Err(TableError::Validation("PartitionKey must not be empty".into()));
        }
        if row_key.is_empty() {
            return Err(TableError::Validation("RowKey must not be empty".into()));
        }

        Ok(Self {
            partition_key,
            row_key,
            properties: BTreeMap::new(),
        })
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    pub fn property(&self, name: &str) -> Option<&EdmValue> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &EdmValue)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Set a named property. Names must be non-empty, must not collide with
    /// the identity fields, and must not contain the annotation marker.
    pub fn insert(&mut self, name: impl Into<String>, value: EdmValue) -> Result<()> {
        let name = name.into();

        if name.is_empty() {
            return Err(TableError::Validation("property name must not be empty".into()));
        }
        if name == "PartitionKey" || name == "RowKey" {
            return Err(TableError::Validation(format!(
                "{} is part of the entity identity, not a property",
                name
            )));
        }
        if name.contains('@') {
            return Err(TableError::Validation(format!(
                "property name {} contains reserved character '@'",
                name
            )));
        }
        if let EdmValue::Double(d) = value {
            if !d.is_finite() {
                return Err(TableError::Validation(format!(
                    "property {} must be a finite double",
                    name
                )));
            }
        }

        self.properties.insert(name, value);
        Ok(())
    }

    /// Overlay another entity's properties onto this one, leaving properties
    /// it does not name untouched. This is the merge half of the
    /// insert-or-merge / insert-or-replace pair.
    pub fn merge_from(&mut self, incoming: &TableEntity) {
        for (name, value) in incoming.properties.iter() {
            self.properties.insert(name.clone(), value.clone());
        }
    }

    /// Keep only the named properties. Identity fields are unaffected.
    pub fn project(&mut self, names: &[String]) {
        self.properties.retain(|k, _| names.iter().any(|n| n == k));
    }

    /// Encode to the OData JSON wire shape.
    pub fn to_wire_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("PartitionKey".into(), Value::String(self.partition_key.clone()));
        map.insert("RowKey".into(), Value::String(self.row_key.clone()));

        for (name, value) in self.properties.iter() {
            if let Some(edm) = value.edm_type() {
                map.insert(format!("{}@odata.type", name), Value::String(edm.into()));
            }
            map.insert(name.clone(), value.to_wire());
        }

        Value::Object(map)
    }

    /// Decode from the OData JSON wire shape. Metadata keys (`odata.*`) are
    /// ignored; annotations steer the kind of the property they name.
    pub fn from_wire_json(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| TableError::Validation("entity payload is not a JSON object".into()))?;

        let key_of = |field: &str| -> Result<String> {
            match map.get(field) {
                Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
                _ => Err(TableError::Validation(format!(
                    "entity payload is missing {}",
                    field
                ))),
            }
        };

        let mut entity = TableEntity::new(key_of("PartitionKey")?, key_of("RowKey")?)?;

        for (name, raw) in map.iter() {
            if name == "PartitionKey" || name == "RowKey" {
                continue;
            }
            if name.starts_with("odata.") || name.contains("@odata") {
                continue;
            }
            // Projected-but-unset properties come back as null; treat them
            // as absent.
            if raw.is_null() {
                continue;
            }
            let annotation = map
                .get(&format!("{}@odata.type", name))
                .and_then(Value::as_str);
            let value = EdmValue::from_wire(name, raw, annotation)?;
            entity.properties.insert(name.clone(), value);
        }

        Ok(entity)
    }
}
