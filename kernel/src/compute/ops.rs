use super::{ComputeFieldError, ComputeOperation, ComputeValue, OutputResult};
use crate::meta::SchemaId;
use crate::schema::{PrimitiveType, Record, RecordSchema, Value};

/// Evaluate one operation against one record. Sums accumulate in f64,
/// outputs are f32.
pub fn evaluate(
    op: &ComputeOperation,
    schema: &RecordSchema,
    schema_id: SchemaId,
    record: &Record,
) -> OutputResult {
    let result = match op {
        ComputeOperation::DotProduct { field, param, .. } => {
            numeric_vector(schema, schema_id, record, field, false)
                .and_then(|v| same_length(field, &v, param).map(|_| dot(&v, param)))
                .map(|d| ComputeValue::Float(d as f32))
        }
        ComputeOperation::CosineSimilarity { field, param, .. } => {
            numeric_vector(schema, schema_id, record, field, true).and_then(|v| {
                same_length(field, &v, param)?;
                cosine(&v, param)
                    .map(|c| ComputeValue::Float(c as f32))
                    .ok_or_else(|| ComputeFieldError::ZeroNorm {
                        field: field.clone(),
                    })
            })
        }
        ComputeOperation::HadamardProduct { field, param, .. } => {
            numeric_vector(schema, schema_id, record, field, false).and_then(|v| {
                same_length(field, &v, param)?;
                Ok(ComputeValue::Vector(
                    v.iter()
                        .zip(param)
                        .map(|(a, b)| (a * f64::from(*b)) as f32)
                        .collect(),
                ))
            })
        }
        ComputeOperation::Count { field, .. } => count(schema, schema_id, record, field),
    };

    match result {
        Ok(value) => OutputResult::Success(value),
        Err(e) => OutputResult::Failure(e),
    }
}

fn numeric_vector(
    schema: &RecordSchema,
    schema_id: SchemaId,
    record: &Record,
    field: &str,
    floating_only: bool,
) -> Result<Vec<f64>, ComputeFieldError> {
    let missing = || ComputeFieldError::MissingField {
        field: field.to_string(),
        schema_id,
    };
    let declared = schema.field(field).ok_or_else(missing)?;

    let expected = if floating_only {
        "array<float|double>"
    } else {
        "array<numeric>"
    };
    let mismatch = |actual: String| ComputeFieldError::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        actual,
    };

    let items = declared
        .field_type
        .primitive_items()
        .ok_or_else(|| mismatch(declared.field_type.to_string()))?;
    let accepted = if floating_only {
        items.is_floating()
    } else {
        items.is_numeric()
    };
    if !accepted {
        return Err(mismatch(declared.field_type.to_string()));
    }

    match record.get(field).ok_or_else(missing)? {
        Value::Array(elements) => elements
            .iter()
            .map(|e| e.as_f64().ok_or_else(|| mismatch(format!("array<{}>", e.kind()))))
            .collect(),
        other => Err(mismatch(other.kind().to_string())),
    }
}

fn count(
    schema: &RecordSchema,
    schema_id: SchemaId,
    record: &Record,
    field: &str,
) -> Result<ComputeValue, ComputeFieldError> {
    let missing = || ComputeFieldError::MissingField {
        field: field.to_string(),
        schema_id,
    };
    schema.field(field).ok_or_else(missing)?;

    let len = match record.get(field).ok_or_else(missing)? {
        Value::Array(elements) => elements.len(),
        Value::String(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        other => {
            return Err(ComputeFieldError::TypeMismatch {
                field: field.to_string(),
                expected: format!("array, {} or {}", PrimitiveType::String.name(), PrimitiveType::Bytes.name()),
                actual: other.kind().to_string(),
            })
        }
    };
    Ok(ComputeValue::Count(i32::try_from(len).unwrap_or(i32::MAX)))
}

fn same_length(field: &str, values: &[f64], param: &[f32]) -> Result<(), ComputeFieldError> {
    if values.len() != param.len() {
        return Err(ComputeFieldError::LengthMismatch {
            field: field.to_string(),
            expected: param.len(),
            actual: values.len(),
        });
    }
    Ok(())
}

fn dot(values: &[f64], param: &[f32]) -> f64 {
    values.iter().zip(param).map(|(a, b)| a * f64::from(*b)).sum()
}

fn cosine(values: &[f64], param: &[f32]) -> Option<f64> {
    let norm_a = values.iter().map(|a| a * a).sum::<f64>().sqrt();
    let norm_b = param.iter().map(|b| f64::from(*b).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot(values, param) / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, FieldType};

    fn schema() -> RecordSchema {
        let field = |name: &str, field_type: FieldType| FieldSchema {
            name: name.into(),
            field_type,
            default: None,
            doc: None,
        };
        RecordSchema {
            name: "MemberFeature".into(),
            namespace: None,
            fields: vec![
                field("id", FieldType::Primitive(PrimitiveType::String)),
                field("member_feature", FieldType::array_of(PrimitiveType::Float)),
                field("counts", FieldType::array_of(PrimitiveType::Int)),
            ],
        }
    }

    fn floats(v: &[f32]) -> Value {
        Value::Array(v.iter().copied().map(Value::Float).collect())
    }

    fn record() -> Record {
        Record::new()
            .with("id", Value::String("id_1".into()))
            .with("member_feature", floats(&[1.0, 2.0, 3.0]))
            .with("counts", Value::Array(vec![Value::Int(2), Value::Int(4)]))
    }

    fn run(op: ComputeOperation) -> OutputResult {
        evaluate(&op, &schema(), 1, &record())
    }

    fn op(kind: &str, field: &str, param: Vec<f32>) -> ComputeOperation {
        let (field, result_field) = (field.to_string(), "out".to_string());
        match kind {
            "dot" => ComputeOperation::DotProduct { field, param, result_field },
            "cos" => ComputeOperation::CosineSimilarity { field, param, result_field },
            "had" => ComputeOperation::HadamardProduct { field, param, result_field },
            _ => ComputeOperation::Count { field, result_field },
        }
    }

    #[test]
    fn dot_product() {
        assert_eq!(
            run(op("dot", "member_feature", vec![1.0, 1.0, 1.0])),
            OutputResult::Success(ComputeValue::Float(6.0))
        );
        assert_eq!(
            run(op("dot", "counts", vec![0.5, 0.25])),
            OutputResult::Success(ComputeValue::Float(2.0))
        );
    }

    #[test]
    fn cosine_similarity_of_parallel_vectors_is_one() {
        let OutputResult::Success(ComputeValue::Float(c)) =
            run(op("cos", "member_feature", vec![2.0, 4.0, 6.0]))
        else {
            panic!("expected a score");
        };
        assert!((c - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_with_zero_parameter_fails() {
        assert_eq!(
            run(op("cos", "member_feature", vec![0.0, 0.0, 0.0])),
            OutputResult::Failure(ComputeFieldError::ZeroNorm {
                field: "member_feature".into()
            })
        );
    }

    #[test]
    fn cosine_requires_floating_items() {
        assert!(matches!(
            run(op("cos", "counts", vec![1.0, 1.0])),
            OutputResult::Failure(ComputeFieldError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn hadamard_product() {
        assert_eq!(
            run(op("had", "member_feature", vec![2.0, 0.5, -1.0])),
            OutputResult::Success(ComputeValue::Vector(vec![2.0, 1.0, -3.0]))
        );
    }

    #[test]
    fn length_mismatch() {
        assert_eq!(
            run(op("dot", "member_feature", vec![1.0])),
            OutputResult::Failure(ComputeFieldError::LengthMismatch {
                field: "member_feature".into(),
                expected: 1,
                actual: 3,
            })
        );
    }

    #[test]
    fn missing_field_names_the_schema() {
        assert_eq!(
            run(op("cos", "companiesEmbedding", vec![1.0])),
            OutputResult::Failure(ComputeFieldError::MissingField {
                field: "companiesEmbedding".into(),
                schema_id: 1,
            })
        );
    }

    #[test]
    fn count_of_array_and_string() {
        assert_eq!(
            run(op("count", "member_feature", vec![])),
            OutputResult::Success(ComputeValue::Count(3))
        );
        assert_eq!(
            run(op("count", "id", vec![])),
            OutputResult::Success(ComputeValue::Count(4))
        );
    }

    #[test]
    fn non_array_vector_field_is_a_type_mismatch() {
        assert!(matches!(
            run(op("dot", "id", vec![1.0])),
            OutputResult::Failure(ComputeFieldError::TypeMismatch { .. })
        ));
    }
}
