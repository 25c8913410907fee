//! Per-mod configuration store.
//!
//! # Responsibility
//! - Own each mod's categorized, typed key/value document.
//! - Persist documents as human-editable TOML files and migrate old schemas.
//!
//! # Invariants
//! - Batch writes become visible together or not at all.
//! - The reload boundary (`flush_and_release` then next access) always runs
//!   the hook chain and migration chain again.

mod batch;
mod document;
mod hooks;
mod migration;
mod store;
mod value;

pub use batch::BatchId;
pub use document::{Category, ConfigDocument};
pub use hooks::DocumentHook;
pub use migration::{MigrationFn, MigrationStep, SchemaMigrations};
pub use store::ConfigStore;
pub use value::{ConfigKey, ConfigValue, ValueKind, DEFAULT_CATEGORY};
