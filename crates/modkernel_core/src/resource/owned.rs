//! Owning, reference-counted handle wrapper.
//!
//! `ResourceRef` holds exactly one count on its handle: cloning retains,
//! dropping releases. Code that stays inside Rust uses it instead of manual
//! retain/release pairs, so the finalizer cannot be skipped or run twice.

use super::handle::{Handle, ResourceTypeId};
use super::registry::ResourceRegistry;
use crate::error::KernelResult;
use log::error;

pub struct ResourceRef {
    registry: ResourceRegistry,
    handle: Handle,
    armed: bool,
}

impl ResourceRef {
    /// Creates a new resource and takes ownership of its initial count.
    pub fn create(registry: &ResourceRegistry, type_id: ResourceTypeId) -> KernelResult<Self> {
        let handle = registry.create(type_id)?;
        Ok(Self::owning(registry, handle))
    }

    /// Retains `handle` and wraps the new count.
    pub fn retain(registry: &ResourceRegistry, handle: Handle) -> KernelResult<Self> {
        registry.retain(handle)?;
        Ok(Self::owning(registry, handle))
    }

    /// Takes over one count the caller already holds on `handle`.
    pub fn adopt(registry: &ResourceRegistry, handle: Handle) -> KernelResult<Self> {
        registry.refcount(handle)?;
        Ok(Self::owning(registry, handle))
    }

    fn owning(registry: &ResourceRegistry, handle: Handle) -> Self {
        Self {
            registry: registry.clone(),
            handle,
            armed: true,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Gives the held count back to the raw retain/release protocol.
    pub fn into_handle(mut self) -> Handle {
        self.armed = false;
        self.handle
    }
}

impl Clone for ResourceRef {
    fn clone(&self) -> Self {
        if let Err(err) = self.registry.retain(self.handle) {
            // Holding a count keeps the handle live; failure means the table is corrupt.
            error!(
                "event=handle_retain module=resource status=error handle={} error={}",
                self.handle, err
            );
        }
        Self::owning(&self.registry, self.handle)
    }
}

impl Drop for ResourceRef {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.registry.release(self.handle) {
            error!(
                "event=handle_release module=resource status=error handle={} error={}",
                self.handle, err
            );
        }
    }
}

impl std::fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRef")
            .field("handle", &self.handle)
            .field("armed", &self.armed)
            .finish()
    }
}
