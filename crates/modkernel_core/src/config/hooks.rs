//! Two-phase load hook chain.
//!
//! Hooks run each time a document is (re)loaded from storage: `pre_load`
//! sees the raw TOML table before it is typed and migrated, `post_load` sees
//! the final document right before readers can observe it. A document a hook
//! changed is marked unsaved, like a migrated one.

use super::document::ConfigDocument;

pub trait DocumentHook: Send + Sync {
    /// Inspects or rewrites the raw document. An error aborts the load.
    fn pre_load(&self, _module: &str, _raw: &mut toml::Table) -> Result<(), String> {
        Ok(())
    }

    /// Inspects or rewrites the typed document. An error aborts the load.
    fn post_load(&self, _module: &str, _document: &mut ConfigDocument) -> Result<(), String> {
        Ok(())
    }
}
