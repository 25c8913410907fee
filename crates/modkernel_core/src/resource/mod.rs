//! Resource handle registry.
//!
//! # Responsibility
//! - Issue opaque generation-counted handles for mod-owned resources.
//! - Own per-type finalizers and invoke them exactly once per handle.
//!
//! # Invariants
//! - Stale handles (old generation) never validate, even after slot reuse.
//! - Finalization happens-before the slot is handed out again.

mod handle;
mod owned;
mod registry;

pub use handle::{Handle, ResourceTypeId};
pub use owned::ResourceRef;
pub use registry::{
    FinalizedResource, Finalizer, ResourceRegistry, ResourceTypeDescriptor, UserData,
};
