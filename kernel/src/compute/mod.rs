// Read Compute
//
// Vector and aggregate operations evaluated against served records.
// Every key is evaluated on its own: a field missing from the schema a
// record was written with fails that operation for that key only, and a
// key that cannot be decoded fails only that key.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

use crate::meta::{SchemaId, VersionNumber};
use crate::schema::{Record, RecordSchema, Value};

pub mod engine;
pub mod ops;

pub use engine::{ComputeConfig, ComputeEngine};

/// One declared operation. `result_field` names the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ComputeOperation {
    DotProduct {
        field: String,
        param: Vec<f32>,
        result_field: String,
    },
    CosineSimilarity {
        field: String,
        param: Vec<f32>,
        result_field: String,
    },
    HadamardProduct {
        field: String,
        param: Vec<f32>,
        result_field: String,
    },
    Count {
        field: String,
        result_field: String,
    },
}

impl ComputeOperation {
    pub fn field(&self) -> &str {
        match self {
            Self::DotProduct { field, .. }
            | Self::CosineSimilarity { field, .. }
            | Self::HadamardProduct { field, .. }
            | Self::Count { field, .. } => field,
        }
    }

    pub fn result_field(&self) -> &str {
        match self {
            Self::DotProduct { result_field, .. }
            | Self::CosineSimilarity { result_field, .. }
            | Self::HadamardProduct { result_field, .. }
            | Self::Count { result_field, .. } => result_field,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request has no operation and no projection")]
    Empty,

    #[error("output `{0}` is produced twice")]
    DuplicateOutput(String),
}

/// Operations plus projected fields, applied to every key of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeRequest {
    #[serde(default)]
    pub operations: Vec<ComputeOperation>,

    #[serde(default)]
    pub projections: Vec<String>,
}

impl ComputeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dot_product(
        mut self,
        field: impl Into<String>,
        param: Vec<f32>,
        result_field: impl Into<String>,
    ) -> Self {
        self.operations.push(ComputeOperation::DotProduct {
            field: field.into(),
            param,
            result_field: result_field.into(),
        });
        self
    }

    pub fn cosine_similarity(
        mut self,
        field: impl Into<String>,
        param: Vec<f32>,
        result_field: impl Into<String>,
    ) -> Self {
        self.operations.push(ComputeOperation::CosineSimilarity {
            field: field.into(),
            param,
            result_field: result_field.into(),
        });
        self
    }

    pub fn hadamard_product(
        mut self,
        field: impl Into<String>,
        param: Vec<f32>,
        result_field: impl Into<String>,
    ) -> Self {
        self.operations.push(ComputeOperation::HadamardProduct {
            field: field.into(),
            param,
            result_field: result_field.into(),
        });
        self
    }

    pub fn count(mut self, field: impl Into<String>, result_field: impl Into<String>) -> Self {
        self.operations.push(ComputeOperation::Count {
            field: field.into(),
            result_field: result_field.into(),
        });
        self
    }

    pub fn project(mut self, field: impl Into<String>) -> Self {
        self.projections.push(field.into());
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.operations.is_empty() && self.projections.is_empty() {
            return Err(RequestError::Empty);
        }
        let mut outputs = BTreeSet::new();
        for name in self
            .operations
            .iter()
            .map(ComputeOperation::result_field)
            .chain(self.projections.iter().map(String::as_str))
        {
            if !outputs.insert(name) {
                return Err(RequestError::DuplicateOutput(name.to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ComputeValue {
    Float(f32),
    Vector(Vec<f32>),
    Count(i32),
}

impl ComputeValue {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            ComputeValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Why one operation produced no output for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComputeFieldError {
    #[error("field `{field}` does not exist in value schema {schema_id}")]
    MissingField { field: String, schema_id: SchemaId },

    #[error("field `{field}` is {actual}, expected {expected}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("field `{field}` has {actual} elements, parameter has {expected}")]
    LengthMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("field `{field}` or the parameter has zero norm")]
    ZeroNorm { field: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputResult {
    Success(ComputeValue),
    Failure(ComputeFieldError),
}

/// Outcome of a request for one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeRecord {
    pub schema_id: SchemaId,

    /// Projected fields present in the record's schema.
    pub projected: BTreeMap<String, Value>,

    pub outputs: BTreeMap<String, ComputeValue>,

    /// Failed operations, by output name.
    pub errors: BTreeMap<String, ComputeFieldError>,
}

impl ComputeRecord {
    /// Evaluate `request` against a record decoded with `schema`.
    pub fn evaluate(
        request: &ComputeRequest,
        schema: &RecordSchema,
        schema_id: SchemaId,
        record: &Record,
    ) -> Self {
        let mut outputs = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for op in &request.operations {
            let name = op.result_field().to_string();
            match ops::evaluate(op, schema, schema_id, record) {
                OutputResult::Success(value) => {
                    outputs.insert(name, value);
                }
                OutputResult::Failure(e) => {
                    errors.insert(name, e);
                }
            }
        }

        let projected = request
            .projections
            .iter()
            .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
            .collect();

        Self {
            schema_id,
            projected,
            outputs,
            errors,
        }
    }
}

/// Failure that prevents evaluating any operation for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum KeyError {
    #[error("value schema {0} is not registered")]
    UnknownSchema(SchemaId),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("decoding failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum KeyResult {
    Computed(ComputeRecord),
    NotFound,
    NotYetVisible,
    Failed { error: KeyError },
    Unresolved { reason: UnresolvedReason },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ComputeError {
    #[error("store `{0}` has no active version")]
    NoActiveVersion(String),

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("no compute worker could be started for `{0}`")]
    NoWorkers(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeResponse {
    pub store: String,

    /// Version every key of the batch was read from.
    pub version: VersionNumber,

    #[serde(serialize_with = "keys_as_text")]
    pub results: BTreeMap<Vec<u8>, KeyResult>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ComputeResponse {
    pub fn get(&self, key: &[u8]) -> Option<&KeyResult> {
        self.results.get(key)
    }

    pub fn unresolved(&self) -> usize {
        self.results
            .values()
            .filter(|r| matches!(r, KeyResult::Unresolved { .. }))
            .count()
    }
}

fn keys_as_text<S: Serializer>(
    results: &BTreeMap<Vec<u8>, KeyResult>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(results.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_outputs_are_rejected() {
        let request = ComputeRequest::new()
            .dot_product("a", vec![1.0], "score")
            .cosine_similarity("b", vec![1.0], "score");

        assert_eq!(
            request.validate(),
            Err(RequestError::DuplicateOutput("score".into()))
        );
        assert_eq!(ComputeRequest::new().validate(), Err(RequestError::Empty));
    }

    #[test]
    fn request_parses_from_json() {
        let request: ComputeRequest = serde_json::from_str(
            r#"{
              "operations": [
                { "op": "cosine_similarity", "field": "companiesEmbedding",
                  "param": [0.1, 0.2], "result_field": "companiesEmbedding_score" },
                { "op": "count", "field": "member_feature", "result_field": "n" }
              ],
              "projections": ["id"]
            }"#,
        )
        .unwrap();

        assert_eq!(request.operations.len(), 2);
        assert_eq!(request.operations[0].field(), "companiesEmbedding");
        assert_eq!(request.operations[1].result_field(), "n");
        assert!(request.validate().is_ok());
    }
}
