// Binary Record Codec
//
// Compact positional encoding of records. Fields are written in schema
// order without names, so a payload can only be decoded with the schema
// that wrote it:
//
// - int / long      zig-zag varint
// - float / double  little-endian IEEE 754
// - boolean         one byte, 0 or 1
// - string / bytes  varint length + raw bytes
// - array           varint item count + items
// - null            nothing

use super::{ComplexType, FieldType, PrimitiveType, Record, RecordSchema, Value};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("missing value for field `{0}`")]
    MissingField(String),

    #[error("field `{field}` expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("unexpected end of input at byte {0}")]
    Truncated(usize),

    #[error("varint overflow at byte {0}")]
    VarintOverflow(usize),

    #[error("value at byte {0} does not fit an int")]
    IntOutOfRange(usize),

    #[error("invalid boolean byte {byte:#04x} at byte {position}")]
    InvalidBoolean { byte: u8, position: usize },

    #[error("invalid utf-8 in field `{0}`")]
    InvalidUtf8(String),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Encode a record with `schema`, taking absent fields from defaults.
pub fn encode_record(schema: &RecordSchema, record: &Record) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for field in &schema.fields {
        match record.get(&field.name) {
            Some(value) => encode_value(&field.field_type, value, &field.name, &mut out)?,
            None => {
                let default = field
                    .default
                    .as_ref()
                    .ok_or_else(|| CodecError::MissingField(field.name.clone()))?;
                let value = Value::from_json(&field.field_type, default, &field.name)?;
                encode_value(&field.field_type, &value, &field.name, &mut out)?;
            }
        }
    }
    Ok(out)
}

/// Decode a payload written with `schema`.
pub fn decode_record(schema: &RecordSchema, bytes: &[u8]) -> Result<Record, CodecError> {
    let mut reader = Reader::new(bytes);
    let mut record = Record::new();
    for field in &schema.fields {
        let value = reader.read_value(&field.field_type, &field.name)?;
        record.insert(field.name.clone(), value);
    }
    reader.finish()?;
    Ok(record)
}

/// Encode a standalone key.
pub fn encode_key(key_type: &FieldType, key: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode_value(key_type, key, "key", &mut out)?;
    Ok(out)
}

pub fn decode_key(key_type: &FieldType, bytes: &[u8]) -> Result<Value, CodecError> {
    let mut reader = Reader::new(bytes);
    let value = reader.read_value(key_type, "key")?;
    reader.finish()?;
    Ok(value)
}

pub fn encode_value(
    field_type: &FieldType,
    value: &Value,
    field: &str,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    match (field_type, value) {
        (FieldType::Primitive(p), value) => encode_primitive(*p, value, field, out),
        (FieldType::Complex(ComplexType::Array { items }), Value::Array(elements)) => {
            write_varint(elements.len() as u64, out);
            for element in elements {
                encode_value(items, element, field, out)?;
            }
            Ok(())
        }
        (expected, actual) => Err(mismatch(field, expected, actual)),
    }
}

fn encode_primitive(
    p: PrimitiveType,
    value: &Value,
    field: &str,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    match (p, value) {
        (PrimitiveType::Null, Value::Null) => {}
        (PrimitiveType::Boolean, Value::Boolean(b)) => out.push(u8::from(*b)),
        (PrimitiveType::Int, Value::Int(v)) => write_long(i64::from(*v), out),
        (PrimitiveType::Long, Value::Long(v)) => write_long(*v, out),
        (PrimitiveType::Long, Value::Int(v)) => write_long(i64::from(*v), out),
        (PrimitiveType::Float, Value::Float(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (PrimitiveType::Double, Value::Double(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (PrimitiveType::Double, Value::Float(v)) => {
            out.extend_from_slice(&f64::from(*v).to_le_bytes())
        }
        (PrimitiveType::String, Value::String(s)) => write_bytes(s.as_bytes(), out),
        (PrimitiveType::Bytes, Value::Bytes(b)) => write_bytes(b, out),
        (p, actual) => return Err(mismatch(field, &FieldType::Primitive(p), actual)),
    }
    Ok(())
}

fn mismatch(field: &str, expected: &FieldType, actual: &Value) -> CodecError {
    CodecError::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        actual: actual.kind().to_string(),
    }
}

fn write_varint(mut n: u64, out: &mut Vec<u8>) {
    while n >= 0x80 {
        out.push((n as u8) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

fn write_long(v: i64, out: &mut Vec<u8>) {
    write_varint(((v << 1) ^ (v >> 63)) as u64, out);
}

fn write_bytes(b: &[u8], out: &mut Vec<u8>) {
    write_varint(b.len() as u64, out);
    out.extend_from_slice(b);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated(self.bytes.len()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_varint(&mut self) -> Result<u64, CodecError> {
        let start = self.pos;
        let mut result = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .bytes
                .get(self.pos)
                .ok_or(CodecError::Truncated(self.pos))?;
            self.pos += 1;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(CodecError::VarintOverflow(start))
    }

    fn read_long(&mut self) -> Result<i64, CodecError> {
        let n = self.read_varint()?;
        Ok(((n >> 1) as i64) ^ -((n & 1) as i64))
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        let start = self.pos;
        let len = self.read_varint()?;
        usize::try_from(len).map_err(|_| CodecError::Truncated(start))
    }

    fn read_value(&mut self, field_type: &FieldType, field: &str) -> Result<Value, CodecError> {
        match field_type {
            FieldType::Primitive(p) => self.read_primitive(*p, field),
            FieldType::Complex(ComplexType::Array { items }) => {
                let count = self.read_len()?;
                let mut elements = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    elements.push(self.read_value(items, field)?);
                }
                Ok(Value::Array(elements))
            }
        }
    }

    fn read_primitive(&mut self, p: PrimitiveType, field: &str) -> Result<Value, CodecError> {
        Ok(match p {
            PrimitiveType::Null => Value::Null,
            PrimitiveType::Boolean => {
                let position = self.pos;
                match self.take(1)?[0] {
                    0 => Value::Boolean(false),
                    1 => Value::Boolean(true),
                    byte => return Err(CodecError::InvalidBoolean { byte, position }),
                }
            }
            PrimitiveType::Int => {
                let position = self.pos;
                let v = self.read_long()?;
                Value::Int(i32::try_from(v).map_err(|_| CodecError::IntOutOfRange(position))?)
            }
            PrimitiveType::Long => Value::Long(self.read_long()?),
            PrimitiveType::Float => {
                let raw: [u8; 4] = self.take(4)?.try_into().map_err(|_| {
                    CodecError::Truncated(self.pos)
                })?;
                Value::Float(f32::from_le_bytes(raw))
            }
            PrimitiveType::Double => {
                let raw: [u8; 8] = self.take(8)?.try_into().map_err(|_| {
                    CodecError::Truncated(self.pos)
                })?;
                Value::Double(f64::from_le_bytes(raw))
            }
            PrimitiveType::String => {
                let len = self.read_len()?;
                let raw = self.take(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| CodecError::InvalidUtf8(field.to_string()))?;
                Value::String(s.to_string())
            }
            PrimitiveType::Bytes => {
                let len = self.read_len()?;
                Value::Bytes(self.take(len)?.to_vec())
            }
        })
    }
}
