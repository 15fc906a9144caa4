// Schema Registry
//
// Per-store key schema and numbered value schemas. Value schema ids
// start at 1 and are never reassigned; registering a schema identical to
// an existing one returns the existing id.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{FieldType, IncompatibleSchemaError, RecordSchema, SchemaCompatibility};
use crate::meta::SchemaId;

pub const VALUE_SCHEMA_STARTING_ID: SchemaId = 1;
pub const KEY_SCHEMA_ID: SchemaId = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no schemas registered for store `{0}`")]
    UnknownStore(String),

    #[error("store `{store}` already has key schema {existing}, not {requested}")]
    KeySchemaConflict {
        store: String,
        existing: FieldType,
        requested: FieldType,
    },

    #[error("new value schema for `{store}` conflicts with schema {existing_id}: {source}")]
    Incompatible {
        store: String,
        existing_id: SchemaId,
        #[source]
        source: IncompatibleSchemaError,
    },
}

#[derive(Debug)]
struct StoreSchemas {
    key: FieldType,
    values: BTreeMap<SchemaId, Arc<RecordSchema>>,
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    stores: RwLock<HashMap<String, StoreSchemas>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key schema of a store. Idempotent for the same schema.
    pub fn register_store(&self, store: &str, key: FieldType) -> Result<SchemaId, RegistryError> {
        let mut stores = self.stores.write();
        let entry = stores.entry(store.to_string()).or_insert_with(|| StoreSchemas {
            key: key.clone(),
            values: BTreeMap::new(),
        });

        if entry.key != key {
            return Err(RegistryError::KeySchemaConflict {
                store: store.to_string(),
                existing: entry.key.clone(),
                requested: key,
            });
        }
        Ok(KEY_SCHEMA_ID)
    }

    /// Register a value schema after checking it can read every schema
    /// already registered for the store.
    pub fn add_value_schema(
        &self,
        store: &str,
        schema: RecordSchema,
        compatibility: &dyn SchemaCompatibility,
    ) -> Result<SchemaId, RegistryError> {
        let mut stores = self.stores.write();
        let entry = stores
            .get_mut(store)
            .ok_or_else(|| RegistryError::UnknownStore(store.to_string()))?;

        if let Some(id) = entry
            .values
            .iter()
            .find_map(|(id, existing)| (**existing == schema).then_some(*id))
        {
            return Ok(id);
        }

        for (existing_id, existing) in &entry.values {
            compatibility
                .check_read_compatible(&schema, existing)
                .map_err(|source| RegistryError::Incompatible {
                    store: store.to_string(),
                    existing_id: *existing_id,
                    source,
                })?;
        }

        let id = entry
            .values
            .keys()
            .next_back()
            .map(|last| last + 1)
            .unwrap_or(VALUE_SCHEMA_STARTING_ID);
        entry.values.insert(id, Arc::new(schema));
        Ok(id)
    }

    pub fn key_schema(&self, store: &str) -> Option<FieldType> {
        self.stores.read().get(store).map(|s| s.key.clone())
    }

    pub fn value_schema(&self, store: &str, id: SchemaId) -> Option<Arc<RecordSchema>> {
        self.stores
            .read()
            .get(store)
            .and_then(|s| s.values.get(&id).cloned())
    }

    /// Every value schema of the store, oldest first.
    pub fn value_schemas(&self, store: &str) -> Vec<(SchemaId, Arc<RecordSchema>)> {
        self.stores
            .read()
            .get(store)
            .map(|s| s.values.iter().map(|(id, v)| (*id, Arc::clone(v))).collect())
            .unwrap_or_default()
    }
}
