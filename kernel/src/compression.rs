// Value Compression
//
// Compression strategies a version can be pushed with. The strategy is
// fixed per version and announced in START_OF_PUSH; readers decompress
// with the version's strategy (and dictionary, when trained).

use serde::{Deserialize, Serialize};
use std::io::Read;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionStrategy {
    #[default]
    NoOp,
    Zstd,

    /// Zstd primed with a dictionary trained on sampled input values.
    ZstdWithDict,
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("zstd operation failed: {0}")]
    Zstd(#[from] std::io::Error),
}

/// Compressor bound to one version's strategy.
#[derive(Debug, Clone)]
pub struct Compressor {
    strategy: CompressionStrategy,
    dictionary: Vec<u8>,
}

impl Compressor {
    pub fn new(strategy: CompressionStrategy, dictionary: Option<&[u8]>) -> Self {
        Self {
            strategy,
            dictionary: dictionary.map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    pub fn strategy(&self) -> CompressionStrategy {
        self.strategy
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self.strategy {
            CompressionStrategy::NoOp => Ok(data.to_vec()),
            // An untrained dictionary degrades to plain zstd on both sides.
            CompressionStrategy::ZstdWithDict if !self.dictionary.is_empty() => {
                let mut compressor =
                    zstd::bulk::Compressor::with_dictionary(ZSTD_LEVEL, &self.dictionary)?;
                Ok(compressor.compress(data)?)
            }
            CompressionStrategy::Zstd | CompressionStrategy::ZstdWithDict => {
                Ok(zstd::stream::encode_all(data, ZSTD_LEVEL)?)
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self.strategy {
            CompressionStrategy::NoOp => Ok(data.to_vec()),
            CompressionStrategy::ZstdWithDict if !self.dictionary.is_empty() => {
                let mut decoder =
                    zstd::stream::read::Decoder::with_dictionary(data, &self.dictionary)?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionStrategy::Zstd | CompressionStrategy::ZstdWithDict => {
                Ok(zstd::stream::decode_all(data)?)
            }
        }
    }
}
