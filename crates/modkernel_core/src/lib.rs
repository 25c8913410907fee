//! Core service layer of the modkernel mod-loading microkernel.
//! This crate owns every runtime invariant; the FFI crate only translates.

pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod imc;
pub mod kernel;
pub mod logging;
pub mod resource;
pub mod settings;

pub use capability::{CapabilityDescriptor, CapabilityRegistry};
pub use config::{ConfigKey, ConfigStore, ConfigValue, ValueKind};
pub use context::ModContext;
pub use error::{KernelError, KernelResult, ResultCode};
pub use imc::{ImcBus, Message, MessageMetadata, Priority, RpcFuture, SubscribeOptions};
pub use kernel::Kernel;
pub use logging::{default_log_level, init_logging, logging_status};
pub use resource::{Handle, ResourceRef, ResourceRegistry, ResourceTypeDescriptor};
pub use settings::KernelSettings;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
