//! C-callable surface of the modkernel microkernel.
//!
//! # Responsibility
//! - Translate size-prefixed C records into core calls and back.
//! - Publish the versioned API tables through the capability registry.
//! - Keep the thread-local last error and thread-bound module.
//!
//! The core crate owns every invariant; nothing here holds kernel state
//! beyond the process instance.

pub mod api;
pub mod config_api;
mod error;
pub mod imc_api;
pub mod records;
pub mod resource_api;
mod state;

pub use state::{
    CONFIG_API_ID, CONFIG_API_NAME, IMC_API_ID, IMC_API_NAME, RESOURCE_API_ID, RESOURCE_API_NAME,
};
