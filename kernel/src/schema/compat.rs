// Schema Compatibility
//
// Read-compatibility between a reader schema and data written with a
// writer schema. The check is an injected capability; the bundled rules
// follow Avro schema resolution for the supported type subset.

use super::{ComplexType, FieldType, PrimitiveType, RecordSchema};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("schema `{reader}` cannot read data written with `{writer}`: {reason}")]
pub struct IncompatibleSchemaError {
    pub reader: String,
    pub writer: String,
    pub reason: String,
}

/// Decides whether records written with one schema can be read with another.
pub trait SchemaCompatibility: Send + Sync {
    fn check_read_compatible(
        &self,
        reader: &RecordSchema,
        writer: &RecordSchema,
    ) -> Result<(), IncompatibleSchemaError>;
}

/// Avro resolution rules:
/// - a field present on both sides must have the same type or a
///   numeric promotion (int -> long -> float -> double)
/// - a reader-only field needs a default
/// - writer-only fields are skipped
#[derive(Debug, Default, Clone, Copy)]
pub struct AvroStyleCompatibility;

impl SchemaCompatibility for AvroStyleCompatibility {
    fn check_read_compatible(
        &self,
        reader: &RecordSchema,
        writer: &RecordSchema,
    ) -> Result<(), IncompatibleSchemaError> {
        let fail = |reason: String| IncompatibleSchemaError {
            reader: reader.full_name(),
            writer: writer.full_name(),
            reason,
        };

        for field in &reader.fields {
            match writer.field(&field.name) {
                Some(written) => {
                    if !can_resolve(&written.field_type, &field.field_type) {
                        return Err(fail(format!(
                            "field `{}` written as {} cannot be read as {}",
                            field.name, written.field_type, field.field_type
                        )));
                    }
                }
                None if field.default.is_none() => {
                    return Err(fail(format!(
                        "field `{}` is missing from the writer and has no default",
                        field.name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn can_resolve(writer: &FieldType, reader: &FieldType) -> bool {
    match (writer, reader) {
        (FieldType::Primitive(w), FieldType::Primitive(r)) => can_promote(*w, *r),
        (
            FieldType::Complex(ComplexType::Array { items: w }),
            FieldType::Complex(ComplexType::Array { items: r }),
        ) => can_resolve(w, r),
        _ => false,
    }
}

fn can_promote(writer: PrimitiveType, reader: PrimitiveType) -> bool {
    use PrimitiveType::*;

    writer == reader
        || matches!(
            (writer, reader),
            (Int, Long | Float | Double) | (Long, Float | Double) | (Float, Double)
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: &str) -> RecordSchema {
        RecordSchema::parse(&format!(r#"{{ "name": "MemberFeature", "fields": [{fields}] }}"#))
            .unwrap()
    }

    #[test]
    fn dropping_a_field_is_compatible() {
        let writer = schema(
            r#"{ "name": "id", "type": "string" },
               { "name": "companiesEmbedding", "type": { "type": "array", "items": "float" } }"#,
        );
        let reader = schema(r#"{ "name": "id", "type": "string" }"#);

        assert!(AvroStyleCompatibility
            .check_read_compatible(&reader, &writer)
            .is_ok());
    }

    #[test]
    fn added_field_requires_default() {
        let writer = schema(r#"{ "name": "id", "type": "string" }"#);
        let without_default = schema(
            r#"{ "name": "id", "type": "string" },
               { "name": "companiesEmbedding", "type": { "type": "array", "items": "float" } }"#,
        );
        let with_default = schema(
            r#"{ "name": "id", "type": "string" },
               { "name": "companiesEmbedding", "default": [],
                 "type": { "type": "array", "items": "float" } }"#,
        );

        let err = AvroStyleCompatibility
            .check_read_compatible(&without_default, &writer)
            .unwrap_err();
        assert!(err.reason.contains("companiesEmbedding"));
        assert!(AvroStyleCompatibility
            .check_read_compatible(&with_default, &writer)
            .is_ok());
    }

    #[test]
    fn numeric_promotion_only_widens() {
        let int_writer = schema(r#"{ "name": "n", "type": "int" }"#);
        let double_reader = schema(r#"{ "name": "n", "type": "double" }"#);

        assert!(AvroStyleCompatibility
            .check_read_compatible(&double_reader, &int_writer)
            .is_ok());
        assert!(AvroStyleCompatibility
            .check_read_compatible(&int_writer, &double_reader)
            .is_err());
    }

    #[test]
    fn array_items_resolve_recursively() {
        let writer = schema(r#"{ "name": "v", "type": { "type": "array", "items": "float" } }"#);
        let reader = schema(r#"{ "name": "v", "type": { "type": "array", "items": "string" } }"#);

        assert!(AvroStyleCompatibility
            .check_read_compatible(&reader, &writer)
            .is_err());
    }
}
