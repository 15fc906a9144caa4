use tracing::{debug, warn};

use super::{read_records, InputDataInfo, ValidationError};
use crate::schema::codec::encode_record;

/// Fewer samples than this never produce a dictionary.
pub const MIN_SAMPLES: usize = 16;

/// Collects value samples and trains a zstd dictionary from them.
///
/// Training is best-effort: every failure yields an empty dictionary and
/// the push continues with plain zstd.
#[derive(Debug)]
pub struct DictionaryTrainer {
    budget: usize,
    used: usize,
    samples: Vec<Vec<u8>>,
    dropped: usize,
}

impl DictionaryTrainer {
    /// `budget` is the total number of sample bytes kept.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            samples: Vec::new(),
            dropped: 0,
        }
    }

    pub fn feed_samples<I, S>(&mut self, samples: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        for sample in samples {
            let sample = sample.as_ref();
            if sample.is_empty() {
                continue;
            }
            if self.used + sample.len() > self.budget {
                self.dropped += 1;
                continue;
            }
            self.used += sample.len();
            self.samples.push(sample.to_vec());
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Train a dictionary of at most `max_size` bytes. Empty when too few
    /// samples were kept or training failed.
    pub fn extract_dictionary(&self, max_size: usize) -> Vec<u8> {
        if self.samples.len() < MIN_SAMPLES {
            debug!(
                samples = self.samples.len(),
                "too few samples for a compression dictionary"
            );
            return Vec::new();
        }
        match zstd::dict::from_samples(&self.samples, max_size) {
            Ok(dictionary) => {
                debug!(
                    samples = self.samples.len(),
                    dropped = self.dropped,
                    size = dictionary.len(),
                    "compression dictionary trained"
                );
                dictionary
            }
            Err(e) => {
                warn!(e=%e, samples = self.samples.len(), "dictionary training failed");
                Vec::new()
            }
        }
    }
}

/// Sample the encoded values of a validated source and train a
/// dictionary. Unreadable records fail here like they would when
/// writing; training itself never fails.
pub fn train_from_source(
    info: &InputDataInfo,
    budget: usize,
    max_size: usize,
) -> Result<Vec<u8>, ValidationError> {
    let mut trainer = DictionaryTrainer::new(budget);
    for record in read_records(info) {
        let record = record?;
        if let Ok(encoded) = encode_record(&info.schema_info.value_schema, &record.value) {
            trainer.feed_samples([encoded]);
        }
    }
    Ok(trainer.extract_dictionary(max_size))
}
