// Value Schemas
//
// Avro-style record schemas describing served values, and the generic
// value model records decode into. One version may hold records written
// with several compatible schemas; every stored record carries the id of
// the schema that encoded it, and fields are always resolved against
// that schema.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod codec;
pub mod compat;
pub mod registry;

pub use codec::CodecError;
pub use compat::{AvroStyleCompatibility, IncompatibleSchemaError, SchemaCompatibility};
pub use registry::{RegistryError, SchemaRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
}

impl PrimitiveType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Long | Self::Float | Self::Double)
    }

    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Bytes => "bytes",
        }
    }
}

/// Type of a single field, in Avro JSON notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldType {
    Primitive(PrimitiveType),
    Complex(ComplexType),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ComplexType {
    Array { items: Box<FieldType> },
}

impl FieldType {
    pub fn array_of(items: PrimitiveType) -> Self {
        FieldType::Complex(ComplexType::Array {
            items: Box::new(FieldType::Primitive(items)),
        })
    }

    /// Item type when this is an array of primitives.
    pub fn primitive_items(&self) -> Option<PrimitiveType> {
        match self {
            FieldType::Complex(ComplexType::Array { items }) => match items.as_ref() {
                FieldType::Primitive(p) => Some(*p),
                FieldType::Complex(_) => None,
            },
            FieldType::Primitive(_) => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::Complex(ComplexType::Array { .. }))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Primitive(p) => f.write_str(p.name()),
            FieldType::Complex(ComplexType::Array { items }) => write!(f, "array<{items}>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

/// Schema of a record value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub fields: Vec<FieldSchema>,
}

impl RecordSchema {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn full_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Requested field does not exist in a schema.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("field `{field}` not found in schema `{schema}`")]
pub struct SchemaFieldError {
    pub schema: String,
    pub field: String,
}

/// Project the schema of one named field.
pub fn derive_sub_schema(
    schema: &RecordSchema,
    field_name: &str,
) -> Result<FieldSchema, SchemaFieldError> {
    schema
        .field(field_name)
        .cloned()
        .ok_or_else(|| SchemaFieldError {
            schema: schema.full_name(),
            field: field_name.to_string(),
        })
}

/// Decoded value of a field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert a JSON document into a value of the given type.
    pub fn from_json(
        field_type: &FieldType,
        json: &serde_json::Value,
        field: &str,
    ) -> Result<Value, CodecError> {
        use serde_json::Value as Json;

        let mismatch = || CodecError::TypeMismatch {
            field: field.to_string(),
            expected: field_type.to_string(),
            actual: json_kind(json).to_string(),
        };

        match field_type {
            FieldType::Primitive(p) => match (p, json) {
                (PrimitiveType::Null, Json::Null) => Ok(Value::Null),
                (PrimitiveType::Boolean, Json::Bool(b)) => Ok(Value::Boolean(*b)),
                (PrimitiveType::Int, Json::Number(n)) => n
                    .as_i64()
                    .and_then(|v| i32::try_from(v).ok())
                    .map(Value::Int)
                    .ok_or_else(mismatch),
                (PrimitiveType::Long, Json::Number(n)) => {
                    n.as_i64().map(Value::Long).ok_or_else(mismatch)
                }
                (PrimitiveType::Float, Json::Number(n)) => n
                    .as_f64()
                    .map(|v| Value::Float(v as f32))
                    .ok_or_else(mismatch),
                (PrimitiveType::Double, Json::Number(n)) => {
                    n.as_f64().map(Value::Double).ok_or_else(mismatch)
                }
                (PrimitiveType::String, Json::String(s)) => Ok(Value::String(s.clone())),
                (PrimitiveType::Bytes, Json::String(s)) => Ok(Value::Bytes(s.as_bytes().to_vec())),
                _ => Err(mismatch()),
            },
            FieldType::Complex(ComplexType::Array { items }) => match json {
                Json::Array(elements) => elements
                    .iter()
                    .map(|e| Value::from_json(items, e, field))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                _ => Err(mismatch()),
            },
        }
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// A decoded record: field name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Build a record from a JSON object, filling absent fields from
    /// schema defaults.
    pub fn from_json(schema: &RecordSchema, json: &serde_json::Value) -> Result<Self, CodecError> {
        let object = json.as_object().ok_or_else(|| CodecError::TypeMismatch {
            field: schema.full_name(),
            expected: "record".into(),
            actual: json_kind(json).into(),
        })?;

        let mut record = Record::new();
        for field in &schema.fields {
            let source = object
                .get(&field.name)
                .or(field.default.as_ref())
                .ok_or_else(|| CodecError::MissingField(field.name.clone()))?;
            record.insert(
                field.name.clone(),
                Value::from_json(&field.field_type, source, &field.name)?,
            );
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMBER_FEATURE_SCHEMA: &str = r#"
    {
      "namespace": "example.compute",
      "type": "record",
      "name": "MemberFeature",
      "fields": [
        { "name": "id", "type": "string" },
        { "name": "name", "type": "string" },
        { "default": [], "doc": "The member companies embedding",
          "name": "companiesEmbedding", "type": { "type": "array", "items": "float" } },
        { "name": "member_feature", "type": { "type": "array", "items": "float" } }
      ]
    }
    "#;

    #[test]
    fn parse_avro_style_record_schema() {
        let schema = RecordSchema::parse(MEMBER_FEATURE_SCHEMA).unwrap();

        assert_eq!(schema.full_name(), "example.compute.MemberFeature");
        assert_eq!(schema.fields.len(), 4);
        let embedding = schema.field("companiesEmbedding").unwrap();
        assert_eq!(embedding.field_type, FieldType::array_of(PrimitiveType::Float));
        assert_eq!(embedding.field_type.to_string(), "array<float>");
    }

    #[test]
    fn sub_schema_of_missing_field_fails() {
        let schema = RecordSchema::parse(MEMBER_FEATURE_SCHEMA).unwrap();

        let sub = derive_sub_schema(&schema, "member_feature").unwrap();
        assert_eq!(sub.field_type.primitive_items(), Some(PrimitiveType::Float));

        let err = derive_sub_schema(&schema, "pymkEmbedding").unwrap_err();
        assert_eq!(err.field, "pymkEmbedding");
    }

    #[test]
    fn record_from_json_applies_defaults() {
        let schema = RecordSchema::parse(MEMBER_FEATURE_SCHEMA).unwrap();
        let json = serde_json::json!({
            "id": "id_1",
            "name": "companiesEmbedding",
            "member_feature": [0.5, 1.5]
        });

        let record = Record::from_json(&schema, &json).unwrap();
        assert_eq!(record.get("companiesEmbedding"), Some(&Value::Array(vec![])));
        assert_eq!(
            record.get("member_feature"),
            Some(&Value::Array(vec![Value::Float(0.5), Value::Float(1.5)]))
        );
    }

    #[test]
    fn record_from_json_rejects_missing_required_field() {
        let schema = RecordSchema::parse(MEMBER_FEATURE_SCHEMA).unwrap();
        let json = serde_json::json!({ "id": "id_1", "name": "n" });

        let err = Record::from_json(&schema, &json).unwrap_err();
        assert_eq!(err, CodecError::MissingField("member_feature".into()));
    }
}
