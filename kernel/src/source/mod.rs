// Push Source Adapter
//
// Validates an input dataset before a push starts and streams its
// records to the writer. A source is a local directory:
//
// - `_schema.json`: `{"key_schema": <type>, "value_schema": <record>}`
// - `*.jsonl`: one `{"key": <json>, "value": <object>}` per line
//
// Files starting with `.` or `_` are never data files.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::compression::CompressionStrategy;
use crate::schema::codec::encode_key;
use crate::schema::{
    CodecError, FieldType, IncompatibleSchemaError, Record, RecordSchema, SchemaCompatibility,
    Value,
};

pub mod dictionary;

pub use dictionary::DictionaryTrainer;

pub const SCHEMA_FILE: &str = "_schema.json";
const DATA_EXTENSION: &str = "jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub compression: CompressionStrategy,

    /// Bytes of encoded values sampled for dictionary training.
    pub dictionary_sample_budget: usize,

    pub max_dictionary_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            compression: CompressionStrategy::NoOp,
            dictionary_sample_budget: 1024 * 1024,
            max_dictionary_size: 64 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("cannot read `{}`: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no _schema.json in `{}`", .0.display())]
    MissingSchema(PathBuf),

    #[error("invalid schema document `{}`: {source}", .path.display())]
    InvalidSchema {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no data file in `{}`", .0.display())]
    NoDataFiles(PathBuf),

    #[error("every data file in `{}` is empty", .0.display())]
    EmptyInput(PathBuf),

    #[error("malformed record at {}:{line}: {reason}", .path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("value schema is incompatible with the store: {0}")]
    IncompatibleSchema(#[from] IncompatibleSchemaError),
}

/// Key and value schema of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub key_schema: FieldType,
    pub value_schema: RecordSchema,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataFile {
    pub path: PathBuf,
    pub byte_size: u64,
    pub record_count: u64,
}

/// Result of validating a source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputDataInfo {
    pub source: PathBuf,
    pub schema_info: SchemaInfo,
    pub total_byte_size: u64,
    pub record_count: u64,
    pub files: Vec<DataFile>,
}

/// One decoded input record. `key` is already serialized with the key
/// schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub key: Vec<u8>,
    pub value: Record,
}

pub struct SourceAdapter {
    config: SourceConfig,
    compatibility: Arc<dyn SchemaCompatibility>,
}

impl SourceAdapter {
    pub fn new(config: SourceConfig, compatibility: Arc<dyn SchemaCompatibility>) -> Self {
        Self {
            config,
            compatibility,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Validate a source against the value schemas already registered
    /// for the target store. The source's value schema, as reader, must
    /// be able to read every one of them.
    pub fn validate(
        &self,
        source: &Path,
        existing: &[Arc<RecordSchema>],
    ) -> Result<InputDataInfo, ValidationError> {
        let schema_info = read_schema(source)?;
        for writer in existing {
            self.compatibility
                .check_read_compatible(&schema_info.value_schema, writer)?;
        }

        let paths = data_files(source)?;
        if paths.is_empty() {
            return Err(ValidationError::NoDataFiles(source.to_path_buf()));
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let byte_size = std::fs::metadata(&path)
                .map_err(|e| unreadable(&path, e))?
                .len();
            if byte_size == 0 {
                warn!(path = %path.display(), "empty data file");
            }
            let mut record_count = 0;
            for record in FileRecords::open(&schema_info, &path)? {
                record?;
                record_count += 1;
            }
            files.push(DataFile {
                path,
                byte_size,
                record_count,
            });
        }

        let total_byte_size = files.iter().map(|f| f.byte_size).sum();
        let record_count = files.iter().map(|f| f.record_count).sum();
        if record_count == 0 {
            return Err(ValidationError::EmptyInput(source.to_path_buf()));
        }

        info!(
            source = %source.display(),
            files = files.len(),
            total_byte_size,
            record_count,
            "source validated"
        );
        Ok(InputDataInfo {
            source: source.to_path_buf(),
            schema_info,
            total_byte_size,
            record_count,
            files,
        })
    }
}

/// Stream the records of a validated source, file by file.
pub fn read_records(info: &InputDataInfo) -> SourceRecords {
    SourceRecords {
        schema: info.schema_info.clone(),
        pending: info.files.iter().rev().map(|f| f.path.clone()).collect(),
        current: None,
    }
}

pub struct SourceRecords {
    schema: SchemaInfo,

    /// Remaining files, last one first.
    pending: Vec<PathBuf>,
    current: Option<FileRecords>,
}

impl Iterator for SourceRecords {
    type Item = Result<SourceRecord, ValidationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = &mut self.current {
                match current.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            let path = self.pending.pop()?;
            match FileRecords::open(&self.schema, &path) {
                Ok(records) => self.current = Some(records),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

struct FileRecords {
    schema: SchemaInfo,
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl FileRecords {
    fn open(schema: &SchemaInfo, path: &Path) -> Result<Self, ValidationError> {
        let file = File::open(path).map_err(|e| unreadable(path, e))?;
        Ok(Self {
            schema: schema.clone(),
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            line: 0,
        })
    }

    fn parse(&self, text: &str) -> Result<SourceRecord, ValidationError> {
        let malformed = |reason: String| ValidationError::MalformedRecord {
            path: self.path.clone(),
            line: self.line,
            reason,
        };
        let codec = |e: CodecError| malformed(e.to_string());

        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
        let key = json
            .get("key")
            .ok_or_else(|| malformed("missing `key`".into()))?;
        let value = json
            .get("value")
            .ok_or_else(|| malformed("missing `value`".into()))?;

        let key = Value::from_json(&self.schema.key_schema, key, "key").map_err(codec)?;
        Ok(SourceRecord {
            key: encode_key(&self.schema.key_schema, &key).map_err(codec)?,
            value: Record::from_json(&self.schema.value_schema, value).map_err(codec)?,
        })
    }
}

impl Iterator for FileRecords {
    type Item = Result<SourceRecord, ValidationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line += 1;
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(unreadable(&self.path, e))),
            };
            if text.trim().is_empty() {
                continue;
            }
            return Some(self.parse(&text));
        }
    }
}

fn read_schema(source: &Path) -> Result<SchemaInfo, ValidationError> {
    let path = source.join(SCHEMA_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::MissingSchema(source.to_path_buf()))
        }
        Err(e) => return Err(unreadable(&path, e)),
    };
    serde_json::from_str(&text).map_err(|source| ValidationError::InvalidSchema { path, source })
}

/// Data files of a source, sorted by name.
fn data_files(source: &Path) -> Result<Vec<PathBuf>, ValidationError> {
    let entries = std::fs::read_dir(source).map_err(|e| unreadable(source, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| unreadable(source, e))?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.') || n.starts_with('_'));
        let data = path.extension().is_some_and(|ext| ext == DATA_EXTENSION);
        if hidden || !data || !path.is_file() {
            debug!(path = %path.display(), "skipping non-data file");
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

fn unreadable(path: &Path, source: std::io::Error) -> ValidationError {
    ValidationError::Unreadable {
        path: path.to_path_buf(),
        source,
    }
}
