//! Opaque resource handle value type.

use std::fmt::{Display, Formatter};

/// Runtime-assigned resource type id. `0` is never assigned.
pub type ResourceTypeId = u32;

/// Opaque `(type, generation, slot)` triple naming one registered resource.
///
/// A handle is a plain value: copying it does not retain the resource. Use
/// [`crate::resource::ResourceRef`] for an owning, reference-counted wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(C)]
pub struct Handle {
    pub type_id: ResourceTypeId,
    pub generation: u32,
    pub slot: u32,
}

impl Handle {
    /// The null handle. Never valid.
    pub const NULL: Handle = Handle {
        type_id: 0,
        generation: 0,
        slot: 0,
    };

    pub fn is_null(&self) -> bool {
        self.type_id == 0 && self.generation == 0
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.type_id, self.generation, self.slot)
    }
}
