//! Process-wide packet registry.
//!
//! Maps packet ids to their decode behaviour: one reserved text id, a table
//! of struct schemas, and raw passthrough for everything else. The table is
//! populated at startup and read concurrently by the ingest path; steady
//! state never mutates it.

use crate::schema::{PacketSchema, SchemaError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// The packet id whose body is interpreted as UTF-8 text unless overridden.
pub const DEFAULT_TEXT_ID: u8 = 0xFF;

/// Thread-safe id → schema table plus the reserved text id.
///
/// Readers take the lock for the duration of a single lookup. Writers are
/// expected only during startup or reconfiguration.
#[derive(Debug)]
pub struct PacketRegistry {
    text_id: u8,
    schemas: RwLock<HashMap<u8, Arc<PacketSchema>>>,
}

impl Default for PacketRegistry {
    fn default() -> Self {
        PacketRegistry::new(DEFAULT_TEXT_ID)
    }
}

impl PacketRegistry {
    /// Create a registry with the given text packet id. The text id is fixed
    /// for the life of the registry.
    pub fn new(text_id: u8) -> Self {
        PacketRegistry {
            text_id,
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn text_id(&self) -> u8 {
        self.text_id
    }

    pub fn is_text(&self, id: u8) -> bool {
        id == self.text_id
    }

    /// Register a schema for `id` after validating its layout invariants.
    ///
    /// Registering the same id twice replaces the earlier entry. A schema may
    /// be registered on the text id, but text decoding takes precedence over
    /// it at parse time.
    pub fn register(&self, id: u8, schema: PacketSchema) -> Result<(), SchemaError> {
        schema.validate()?;
        let mut table = self
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        table.insert(id, Arc::new(schema));
        Ok(())
    }

    /// Look up the schema registered for `id`, if any.
    pub fn lookup(&self, id: u8) -> Option<Arc<PacketSchema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Snapshot of every registered (id, schema) pair, ascending by id.
    /// Used to build the bridge channel table at startup.
    pub fn snapshot(&self) -> Vec<(u8, Arc<PacketSchema>)> {
        let mut entries: Vec<_> = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, schema)| (*id, Arc::clone(schema)))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}
