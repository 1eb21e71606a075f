//! Registry of record definitions and CCSDS packet cross-references.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::schema::{DefinitionError, RecordDefinition, RecordKind, SchemaBuilder};
use super::ccsds;
use crate::{Result, TracklineError};

/// Read-mostly table of record definitions keyed by type name.
///
/// Registries are explicit context objects: components receive an
/// `Arc<RecordRegistry>` rather than consulting a process-wide table, so tests
/// can run with isolated definitions.
#[derive(Debug, Default)]
pub struct RecordRegistry {
    definitions: RwLock<HashMap<String, Arc<RecordDefinition>>>,
    packets: RwLock<HashMap<u32, Arc<RecordDefinition>>>,
}

impl RecordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the container, status and ICESat-2 record types.
    pub fn with_builtin_records() -> Result<Arc<Self>> {
        let registry = Self::new();
        super::container::define_records(&registry)?;
        super::exception::define_records(&registry)?;
        crate::dispatch::limit::define_records(&registry)?;
        crate::icesat2::define_records(&registry)?;
        Ok(Arc::new(registry))
    }

    /// Registers a built definition.
    ///
    /// A duplicate name is rejected and the existing definition is kept.
    pub fn define(
        &self,
        definition: RecordDefinition,
    ) -> std::result::Result<Arc<RecordDefinition>, DefinitionError> {
        let mut definitions = self.definitions.write();
        if definitions.contains_key(definition.name()) {
            return Err(DefinitionError::Duplicate { name: definition.name().to_string() });
        }
        let definition = Arc::new(definition);
        definitions.insert(definition.name().to_string(), Arc::clone(&definition));
        debug!(record_type = definition.name(), size = definition.size(), "record defined");
        Ok(definition)
    }

    /// Builds and registers a definition in one step.
    pub fn define_with(&self, builder: SchemaBuilder) -> Result<Arc<RecordDefinition>> {
        Ok(self.define(builder.build()?)?)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<RecordDefinition>> {
        self.definitions.read().get(name).cloned()
    }

    /// Like [`lookup`](Self::lookup) but reports a missing type as an error.
    pub fn get(&self, name: &str) -> Result<Arc<RecordDefinition>> {
        self.lookup(name).ok_or_else(|| TracklineError::schema_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Registers a CCSDS command packet definition of `size` bytes.
    pub fn define_ccsds_command(
        &self,
        builder: SchemaBuilder,
        apid: u16,
        function_code: u8,
        size: usize,
    ) -> Result<Arc<RecordDefinition>> {
        let kind = RecordKind::CcsdsCommand { apid, function_code };
        self.define_packet(builder.size(size).kind(kind).build()?)
    }

    /// Registers a CCSDS telemetry packet definition of `size` bytes.
    pub fn define_ccsds_telemetry(
        &self,
        builder: SchemaBuilder,
        apid: u16,
        size: usize,
    ) -> Result<Arc<RecordDefinition>> {
        let kind = RecordKind::CcsdsTelemetry { apid };
        self.define_packet(builder.size(size).kind(kind).build()?)
    }

    fn define_packet(&self, definition: RecordDefinition) -> Result<Arc<RecordDefinition>> {
        let key = ccsds::xref_key(definition.kind()).ok_or_else(|| {
            TracklineError::invalid_definition(definition.name(), "not a CCSDS packet")
        })?;
        let mut packets = self.packets.write();
        let definition = self.define(definition)?;
        packets.insert(key, Arc::clone(&definition));
        Ok(definition)
    }

    /// Resolves a CCSDS definition from a raw packet's primary header.
    pub fn ccsds_lookup(&self, packet: &[u8]) -> Option<Arc<RecordDefinition>> {
        let key = ccsds::packet_key(packet)?;
        self.packets.read().get(&key).cloned()
    }
}
