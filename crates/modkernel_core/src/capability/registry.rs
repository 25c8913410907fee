//! Name/id keyed capability table.

use super::descriptor::{ApiId, CapabilityDescriptor};
use crate::error::{KernelError, KernelResult};
use log::info;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Type-erased capability object stored in a row.
pub type Capability = Arc<dyn Any + Send + Sync>;

/// One registered capability row.
#[derive(Clone)]
pub struct RegisteredCapability {
    pub descriptor: CapabilityDescriptor,
    pub capability: Capability,
}

#[derive(Default)]
struct Tables {
    by_name: BTreeMap<String, RegisteredCapability>,
    name_by_id: BTreeMap<ApiId, String>,
}

/// In-process capability registry.
///
/// Rows are resolved by stable name or by integer id. Mutation takes the one
/// write lock; lookups clone the `Arc` out and release it immediately.
#[derive(Default)]
pub struct CapabilityRegistry {
    tables: RwLock<Tables>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one capability row after descriptor validation.
    pub fn register(
        &self,
        descriptor: CapabilityDescriptor,
        capability: Capability,
    ) -> KernelResult<()> {
        descriptor.validate()?;
        let mut tables = self.tables.write();
        if tables.by_name.contains_key(descriptor.name.as_str()) {
            return Err(KernelError::AlreadyExists(format!(
                "capability `{}`",
                descriptor.name
            )));
        }
        if let Some(existing) = tables.name_by_id.get(&descriptor.id) {
            return Err(KernelError::AlreadyExists(format!(
                "capability id {} (held by `{existing}`)",
                descriptor.id
            )));
        }

        info!(
            "event=capability_register module=capability status=ok name={} id={} version={}",
            descriptor.name, descriptor.id, descriptor.version
        );
        tables
            .name_by_id
            .insert(descriptor.id, descriptor.name.clone());
        tables.by_name.insert(
            descriptor.name.clone(),
            RegisteredCapability {
                descriptor,
                capability,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().by_name.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Capability> {
        self.entry(name).map(|entry| entry.capability)
    }

    pub fn get_by_id(&self, id: ApiId) -> Option<Capability> {
        let tables = self.tables.read();
        let name = tables.name_by_id.get(&id)?;
        tables
            .by_name
            .get(name)
            .map(|entry| Arc::clone(&entry.capability))
    }

    /// Typed lookup by name.
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name)?.downcast::<T>().ok()
    }

    /// Typed lookup by id.
    pub fn get_by_id_as<T: Any + Send + Sync>(&self, id: ApiId) -> Option<Arc<T>> {
        self.get_by_id(id)?.downcast::<T>().ok()
    }

    /// Resolves a row name to its integer id.
    pub fn api_id(&self, name: &str) -> Option<ApiId> {
        self.tables
            .read()
            .by_name
            .get(name)
            .map(|entry| entry.descriptor.id)
    }

    pub fn entry(&self, name: &str) -> Option<RegisteredCapability> {
        self.tables.read().by_name.get(name).cloned()
    }

    /// Returns every row descriptor sorted by name.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.tables
            .read()
            .by_name
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }
}
