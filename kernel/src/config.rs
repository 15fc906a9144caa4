// Push Job Configuration
//
// Every tunable of a push, loaded from JSON. Absent sections and fields
// take their built-in defaults; durations are human-readable ("30m").

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::activation::ActivationConfig;
use crate::compute::ComputeConfig;
use crate::source::SourceConfig;
use crate::status::{PolicyError, StatusPolicy};
use crate::writer::WriterConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid status policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushJobConfig {
    pub source: SourceConfig,
    pub writer: WriterConfig,
    pub status: StatusPolicy,
    pub activation: ActivationConfig,
    pub compute: ComputeConfig,
}

impl PushJobConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.status.validate()?;
        if self.writer.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "writer.chunk_size",
                reason: "must be positive".into(),
            });
        }
        if self.compute.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "compute.workers",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}
