//! Capability registry.
//!
//! Every kernel service publishes its entry points here so callers resolve
//! them by stable name or integer id instead of linking against each other.

mod descriptor;
mod registry;

pub use descriptor::{is_valid_dotted_name, ApiId, CapabilityDescriptor};
pub use registry::{Capability, CapabilityRegistry, RegisteredCapability};
