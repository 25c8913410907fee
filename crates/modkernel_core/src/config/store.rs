//! Per-mod configuration store.
//!
//! # Responsibility
//! - Lazily load, cache and persist one TOML document per mod.
//! - Serve point reads/writes, enumeration, defaults and atomic batches.
//! - Run pre/post-load hooks and schema migrations at every (re)load.
//!
//! # Invariants
//! - Each cached document has its own reader/writer lock; the cache map lock
//!   is only held to look up or evict a cell, never across document work.
//! - A document is loaded at most once per cache lifetime (`loaded` flag
//!   double-checked under a per-document load lock).
//! - Files are replaced atomically (temp file in the same directory + rename).
//! - A failed write leaves the in-memory document valid and dirty.
//! - Hooks and migration functions never run under the cache map lock or a
//!   document lock.

use super::batch::{BatchId, BatchTable};
use super::document::{parse_raw, ConfigDocument, SCHEMA_VERSION_FIELD};
use super::hooks::DocumentHook;
use super::migration::{MigrationFn, SchemaMigrations};
use super::value::{ConfigKey, ConfigValue, ValueKind};
use crate::context::ModContext;
use crate::error::{KernelError, KernelResult};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const DOCUMENT_EXTENSION: &str = "toml";

#[derive(Default)]
struct DocumentCell {
    loaded: AtomicBool,
    load_lock: Mutex<()>,
    document: RwLock<ConfigDocument>,
    dirty: AtomicBool,
    evicted: AtomicBool,
    persist_lock: Mutex<()>,
}

/// Thread-safe store of per-mod configuration documents.
pub struct ConfigStore {
    root: PathBuf,
    documents: RwLock<HashMap<String, Arc<DocumentCell>>>,
    schemas: RwLock<HashMap<String, SchemaMigrations>>,
    defaults: RwLock<HashMap<String, BTreeMap<ConfigKey, ConfigValue>>>,
    hooks: RwLock<Vec<Arc<dyn DocumentHook>>>,
    batches: BatchTable,
}

impl ConfigStore {
    /// Creates a store persisting documents under `root`.
    ///
    /// The directory is created on first write, not here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            documents: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
            batches: BatchTable::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the backing file for one mod.
    pub fn document_path(&self, module: &ModContext) -> PathBuf {
        self.root
            .join(format!("{}.{DOCUMENT_EXTENSION}", module.name()))
    }

    /// Appends a load hook to the chain. Applies to subsequent loads.
    pub fn add_hook(&self, hook: Arc<dyn DocumentHook>) {
        self.hooks.write().push(hook);
    }

    /// Declares the current schema version of a mod's document.
    pub fn set_schema_version(&self, module: &ModContext, version: u32) {
        self.schemas
            .write()
            .entry(module.name().to_string())
            .or_default()
            .set_current_version(version);
    }

    /// Registers one migration step for a mod's document.
    pub fn register_migration(
        &self,
        module: &ModContext,
        from_version: u32,
        to_version: u32,
        migrate: impl Fn(&mut ConfigDocument) -> Result<(), String> + Send + Sync + 'static,
    ) -> KernelResult<()> {
        let migrate: MigrationFn = Arc::new(migrate);
        self.schemas
            .write()
            .entry(module.name().to_string())
            .or_default()
            .register(from_version, to_version, migrate)
    }

    /// Registers the fallback value returned when `key` has no stored value.
    pub fn register_default(
        &self,
        module: &ModContext,
        key: &ConfigKey,
        value: ConfigValue,
    ) -> KernelResult<()> {
        key.validate()?;
        self.defaults
            .write()
            .entry(module.name().to_string())
            .or_default()
            .insert(key.clone(), value);
        Ok(())
    }

    /// Returns the stored value, falling back to the registered default.
    pub fn get(&self, module: &ModContext, key: &ConfigKey) -> KernelResult<ConfigValue> {
        key.validate()?;
        let stored = self.read_document(module, |document| document.get(key).cloned())?;
        if let Some(value) = stored {
            return Ok(value);
        }
        self.default_for(module, key)
            .ok_or_else(|| KernelError::NotFound(format!("config entry `{key}` of `{}`", module.name())))
    }

    pub fn get_bool(&self, module: &ModContext, key: &ConfigKey) -> KernelResult<bool> {
        let value = self.get(module, key)?;
        value
            .as_bool()
            .ok_or_else(|| mismatch(key, ValueKind::Bool, &value))
    }

    pub fn get_int(&self, module: &ModContext, key: &ConfigKey) -> KernelResult<i64> {
        let value = self.get(module, key)?;
        value
            .as_integer()
            .ok_or_else(|| mismatch(key, ValueKind::Integer, &value))
    }

    pub fn get_float(&self, module: &ModContext, key: &ConfigKey) -> KernelResult<f64> {
        let value = self.get(module, key)?;
        value
            .as_float()
            .ok_or_else(|| mismatch(key, ValueKind::Float, &value))
    }

    pub fn get_string(&self, module: &ModContext, key: &ConfigKey) -> KernelResult<String> {
        match self.get(module, key)? {
            ConfigValue::String(value) => Ok(value),
            other => Err(mismatch(key, ValueKind::String, &other)),
        }
    }

    /// Stores a value in memory and marks the document dirty.
    ///
    /// # Errors
    /// - `TypeMismatch` when a default of another kind is registered for `key`.
    pub fn set(&self, module: &ModContext, key: &ConfigKey, value: ConfigValue) -> KernelResult<()> {
        key.validate()?;
        self.check_default_kind(module, key, &value)?;
        self.write_document(module, |document| {
            document.set(key, value);
            true
        })?;
        Ok(())
    }

    /// Removes the stored value so reads fall back to the default.
    ///
    /// Returns whether a stored value existed.
    pub fn reset(&self, module: &ModContext, key: &ConfigKey) -> KernelResult<bool> {
        key.validate()?;
        self.write_document(module, |document| document.remove(key).is_some())
    }

    /// Visits stored entries, optionally limited to one category.
    ///
    /// The callback runs on a snapshot without any store lock held; returning
    /// `false` stops the walk. Returns the number of entries visited.
    pub fn enumerate(
        &self,
        module: &ModContext,
        category: Option<&str>,
        mut visit: impl FnMut(&ConfigKey, &ConfigValue) -> bool,
    ) -> KernelResult<usize> {
        let snapshot = self.read_document(module, |document| document.entries(category))?;
        let mut visited = 0;
        for (key, value) in &snapshot {
            visited += 1;
            if !visit(key, value) {
                break;
            }
        }
        Ok(visited)
    }

    /// Returns a copy of the current document.
    pub fn snapshot(&self, module: &ModContext) -> KernelResult<ConfigDocument> {
        self.read_document(module, ConfigDocument::clone)
    }

    /// Opens a batch owned by `module`.
    pub fn batch_begin(&self, module: &ModContext) -> BatchId {
        let id = self.batches.begin(module);
        debug!(
            "event=config_batch module=config status=start mod={} batch={}",
            module.name(),
            id
        );
        id
    }

    /// Stages one write. Returns the number of staged writes.
    pub fn batch_set(
        &self,
        module: &ModContext,
        batch: BatchId,
        key: ConfigKey,
        value: ConfigValue,
    ) -> KernelResult<usize> {
        self.batches.stage(module, batch, key, value)
    }

    /// Applies every staged write as one visible unit, then persists.
    ///
    /// All writes are validated before any is applied; a validation failure
    /// consumes the batch and leaves the document untouched. A persistence
    /// failure is returned after the writes became visible.
    pub fn batch_commit(&self, module: &ModContext, batch: BatchId) -> KernelResult<usize> {
        let pending = self.batches.take(module, batch)?;
        for (key, value) in &pending.writes {
            self.check_default_kind(module, key, value)?;
        }

        let count = pending.writes.len();
        self.write_document(module, move |document| {
            for (key, value) in pending.writes {
                document.set(&key, value);
            }
            count > 0
        })?;
        info!(
            "event=config_batch module=config status=ok mod={} batch={} writes={}",
            module.name(),
            batch,
            count
        );
        self.flush(module)?;
        Ok(count)
    }

    /// Drops every staged write of a batch.
    pub fn batch_discard(&self, module: &ModContext, batch: BatchId) -> KernelResult<()> {
        self.batches.take(module, batch)?;
        debug!(
            "event=config_batch module=config status=discarded mod={} batch={}",
            module.name(),
            batch
        );
        Ok(())
    }

    pub fn batch_staged_len(&self, batch: BatchId) -> Option<usize> {
        self.batches.staged_len(batch)
    }

    /// Discards every open batch owned by `module`. Returns the count.
    pub fn discard_batches_owned_by(&self, module: &ModContext) -> usize {
        self.batches.discard_owned_by(module)
    }

    /// Persists the document if it has unsaved changes. Keeps it cached.
    pub fn flush(&self, module: &ModContext) -> KernelResult<bool> {
        let Some(cell) = self.cached_cell(module) else {
            return Ok(false);
        };
        let _persisting = cell.persist_lock.lock();
        let snapshot = {
            let document = cell.document.read();
            if !cell.dirty.swap(false, Ordering::AcqRel) {
                return Ok(false);
            }
            document.clone()
        };
        if let Err(err) = self.persist(module, &snapshot) {
            cell.dirty.store(true, Ordering::Release);
            return Err(err);
        }
        Ok(true)
    }

    /// Persists pending changes and evicts the cached document.
    ///
    /// The next access reloads from storage and re-runs hooks and
    /// migrations. On persistence failure the document stays cached.
    pub fn flush_and_release(&self, module: &ModContext) -> KernelResult<()> {
        let Some(cell) = self.cached_cell(module) else {
            return Ok(());
        };
        let _persisting = cell.persist_lock.lock();
        let document = cell.document.write();
        if cell.dirty.load(Ordering::Acquire) {
            self.persist(module, &document)?;
            cell.dirty.store(false, Ordering::Release);
        }

        self.evict(module, &cell);
        drop(document);

        info!(
            "event=config_release module=config status=ok mod={}",
            module.name()
        );
        Ok(())
    }

    /// Evicts the cached document without persisting it. Unsaved changes
    /// are lost. Returns whether a document was cached.
    pub fn drop_cached(&self, module: &ModContext) -> bool {
        let Some(cell) = self.cached_cell(module) else {
            return false;
        };
        let _persisting = cell.persist_lock.lock();
        let document = cell.document.write();
        self.evict(module, &cell);
        drop(document);

        warn!(
            "event=config_drop module=config status=ok mod={} dirty={}",
            module.name(),
            cell.dirty.load(Ordering::Acquire)
        );
        true
    }

    /// Caller holds the cell's document write lock.
    fn evict(&self, module: &ModContext, cell: &Arc<DocumentCell>) {
        let mut documents = self.documents.write();
        if documents
            .get(module.name())
            .is_some_and(|current| Arc::ptr_eq(current, cell))
        {
            documents.remove(module.name());
        }
        drop(documents);
        cell.evicted.store(true, Ordering::Release);
    }

    /// Whether a document for `module` is currently cached in memory.
    pub fn is_cached(&self, module: &ModContext) -> bool {
        self.cached_cell(module)
            .is_some_and(|cell| cell.loaded.load(Ordering::Acquire))
    }

    /// Names of every mod whose document is cached, sorted.
    pub fn cached_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.documents.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn cached_cell(&self, module: &ModContext) -> Option<Arc<DocumentCell>> {
        self.documents.read().get(module.name()).cloned()
    }

    fn cell(&self, module: &ModContext) -> Arc<DocumentCell> {
        if let Some(cell) = self.cached_cell(module) {
            return cell;
        }
        Arc::clone(
            self.documents
                .write()
                .entry(module.name().to_string())
                .or_default(),
        )
    }

    fn loaded_cell(&self, module: &ModContext) -> KernelResult<Arc<DocumentCell>> {
        let cell = self.cell(module);
        if cell.loaded.load(Ordering::Acquire) {
            return Ok(cell);
        }

        {
            let _loading = cell.load_lock.lock();
            if !cell.loaded.load(Ordering::Acquire) {
                let (document, changed) = self.load(module)?;
                *cell.document.write() = document;
                cell.dirty.store(changed, Ordering::Release);
                cell.loaded.store(true, Ordering::Release);
            }
        }
        Ok(cell)
    }

    fn read_document<T>(
        &self,
        module: &ModContext,
        read: impl Fn(&ConfigDocument) -> T,
    ) -> KernelResult<T> {
        loop {
            let cell = self.loaded_cell(module)?;
            let document = cell.document.read();
            if cell.evicted.load(Ordering::Acquire) {
                continue;
            }
            return Ok(read(&document));
        }
    }

    fn write_document(
        &self,
        module: &ModContext,
        write: impl FnOnce(&mut ConfigDocument) -> bool,
    ) -> KernelResult<bool> {
        let mut write = Some(write);
        loop {
            let cell = self.loaded_cell(module)?;
            let mut document = cell.document.write();
            if cell.evicted.load(Ordering::Acquire) {
                continue;
            }
            let Some(write) = write.take() else {
                return Err(KernelError::Internal(
                    "config write closure consumed twice".to_string(),
                ));
            };
            let changed = write(&mut document);
            if changed {
                cell.dirty.store(true, Ordering::Release);
            }
            return Ok(changed);
        }
    }

    fn default_for(&self, module: &ModContext, key: &ConfigKey) -> Option<ConfigValue> {
        self.defaults
            .read()
            .get(module.name())
            .and_then(|defaults| defaults.get(key).cloned())
    }

    fn check_default_kind(
        &self,
        module: &ModContext,
        key: &ConfigKey,
        value: &ConfigValue,
    ) -> KernelResult<()> {
        match self.default_for(module, key) {
            Some(default) if default.kind() != value.kind() => {
                Err(mismatch(key, default.kind(), value))
            }
            _ => Ok(()),
        }
    }

    /// Reads, hooks, types and migrates one document from storage.
    ///
    /// Returns the document and whether migration changed it.
    fn load(&self, module: &ModContext) -> KernelResult<(ConfigDocument, bool)> {
        let started_at = Instant::now();
        let path = self.document_path(module);
        let schema = self.schemas.read().get(module.name()).cloned();

        let result = self.load_with_schema(module, &path, schema.as_ref());
        match &result {
            Ok((document, changed)) => info!(
                "event=config_load module=config status=ok mod={} version={} entries={} changed={} duration_ms={}",
                module.name(),
                document.schema_version,
                document.len(),
                changed,
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=config_load module=config status=error mod={} duration_ms={} error_code={} error={}",
                module.name(),
                started_at.elapsed().as_millis(),
                err.label(),
                err
            ),
        }
        result
    }

    fn load_with_schema(
        &self,
        module: &ModContext,
        path: &Path,
        schema: Option<&SchemaMigrations>,
    ) -> KernelResult<(ConfigDocument, bool)> {
        let hooks: Vec<Arc<dyn DocumentHook>> = self.hooks.read().clone();

        let mut raw = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|err| KernelError::io(path, err))?;
            parse_raw(path, &text)?
        } else {
            let version = schema.map_or(0, SchemaMigrations::current_version);
            let mut fresh = toml::Table::new();
            fresh.insert(
                SCHEMA_VERSION_FIELD.to_string(),
                toml::Value::Integer(i64::from(version)),
            );
            fresh
        };

        let stored = raw.clone();
        for hook in &hooks {
            run_hook(path, "pre_load", || hook.pre_load(module.name(), &mut raw))?;
        }
        let mut rewritten = raw != stored;

        let mut document = ConfigDocument::from_raw(path, &raw)?;
        // Mods without a declared schema keep whatever version is stored.
        let migrated = match schema {
            Some(schema) => schema.apply(module.name(), &mut document)?,
            None => 0,
        };

        let before_hooks = document.clone();
        for hook in &hooks {
            run_hook(path, "post_load", || hook.post_load(module.name(), &mut document))?;
        }
        rewritten |= document != before_hooks;
        // Migrated or hook-rewritten documents are unsaved until the next flush.
        Ok((document, migrated > 0 || rewritten))
    }

    fn persist(&self, module: &ModContext, document: &ConfigDocument) -> KernelResult<()> {
        let started_at = Instant::now();
        let path = self.document_path(module);
        let result = write_atomically(&self.root, &path, document);
        match &result {
            Ok(()) => info!(
                "event=config_flush module=config status=ok mod={} duration_ms={}",
                module.name(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=config_flush module=config status=error mod={} duration_ms={} error_code={} error={}",
                module.name(),
                started_at.elapsed().as_millis(),
                err.label(),
                err
            ),
        }
        result
    }
}

fn mismatch(key: &ConfigKey, expected: ValueKind, actual: &ConfigValue) -> KernelError {
    KernelError::TypeMismatch {
        key: key.to_string(),
        expected: expected.as_str(),
        actual: actual.kind().as_str(),
    }
}

fn run_hook(
    path: &Path,
    phase: &str,
    hook: impl FnOnce() -> Result<(), String>,
) -> KernelResult<()> {
    let message = match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(message)) => message,
        Err(_) => "hook panicked".to_string(),
    };
    Err(KernelError::Parse {
        path: path.to_path_buf(),
        message: format!("{phase} hook rejected document: {message}"),
    })
}

fn write_atomically(root: &Path, path: &Path, document: &ConfigDocument) -> KernelResult<()> {
    let text = document.to_toml_string()?;
    std::fs::create_dir_all(root).map_err(|err| KernelError::io(root, err))?;
    let mut file = tempfile::NamedTempFile::new_in(root).map_err(|err| KernelError::io(root, err))?;
    file.write_all(text.as_bytes())
        .map_err(|err| KernelError::io(file.path(), err))?;
    file.as_file()
        .sync_all()
        .map_err(|err| KernelError::io(file.path(), err))?;
    file.persist(path)
        .map_err(|err| KernelError::io(path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ConfigStore;
    use crate::config::{ConfigKey, ConfigValue};
    use crate::context::ModContext;
    use crate::error::KernelError;
    use crate::resource::Handle;

    fn module(name: &str) -> ModContext {
        ModContext::new(
            Handle {
                type_id: 1,
                generation: 1,
                slot: 0,
            },
            name,
        )
    }

    #[test]
    fn loads_lazily_and_reloads_after_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        let mod_a = module("alpha");
        assert!(!store.is_cached(&mod_a));

        store
            .set(&mod_a, &ConfigKey::new("ui", "scale"), ConfigValue::Float(1.5))
            .expect("set");
        assert!(store.is_cached(&mod_a));
        store.flush_and_release(&mod_a).expect("release");
        assert!(!store.is_cached(&mod_a));
        assert!(store.document_path(&mod_a).exists());

        assert_eq!(
            store
                .get_float(&mod_a, &ConfigKey::new("ui", "scale"))
                .expect("reloaded"),
            1.5
        );
    }

    #[test]
    fn flush_only_writes_dirty_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        let mod_a = module("alpha");
        assert!(!store.flush(&mod_a).expect("nothing cached"));

        store
            .set(&mod_a, &ConfigKey::new("ui", "theme"), ConfigValue::from("dark"))
            .expect("set");
        assert!(store.flush(&mod_a).expect("dirty flush"));
        assert!(!store.flush(&mod_a).expect("clean flush"));
    }

    #[test]
    fn defaults_back_reads_and_constrain_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        let mod_a = module("alpha");
        let key = ConfigKey::new("net", "retries");
        assert!(matches!(
            store.get(&mod_a, &key),
            Err(KernelError::NotFound(_))
        ));

        store
            .register_default(&mod_a, &key, ConfigValue::Integer(3))
            .expect("default");
        assert_eq!(store.get_int(&mod_a, &key).expect("default value"), 3);
        assert!(matches!(
            store.set(&mod_a, &key, ConfigValue::from("three")),
            Err(KernelError::TypeMismatch { .. })
        ));
        store
            .set(&mod_a, &key, ConfigValue::Integer(5))
            .expect("same kind");
        assert_eq!(store.get_int(&mod_a, &key).expect("stored"), 5);
        assert!(store.reset(&mod_a, &key).expect("reset"));
        assert_eq!(store.get_int(&mod_a, &key).expect("back to default"), 3);
        assert!(!store.reset(&mod_a, &key).expect("second reset"));
    }

    #[test]
    fn typed_accessor_reports_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        let mod_a = module("alpha");
        let key = ConfigKey::new("ui", "title");
        store
            .set(&mod_a, &key, ConfigValue::from("hello"))
            .expect("set");
        let err = store.get_bool(&mod_a, &key).expect_err("mismatch");
        assert!(matches!(
            err,
            KernelError::TypeMismatch {
                expected: "bool",
                actual: "string",
                ..
            }
        ));
    }

    #[test]
    fn enumerate_visits_snapshot_and_stops_early() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        let mod_a = module("alpha");
        for index in 0..4 {
            store
                .set(
                    &mod_a,
                    &ConfigKey::new("list", format!("k{index}")),
                    ConfigValue::Integer(index),
                )
                .expect("set");
        }
        store
            .set(&mod_a, &ConfigKey::new("other", "x"), ConfigValue::Bool(false))
            .expect("set other");

        let mut seen = Vec::new();
        let visited = store
            .enumerate(&mod_a, Some("list"), |key, _| {
                seen.push(key.key.clone());
                seen.len() < 2
            })
            .expect("enumerate");
        assert_eq!(visited, 2);
        assert_eq!(seen, vec!["k0".to_string(), "k1".to_string()]);

        let all = store.enumerate(&mod_a, None, |_, _| true).expect("all");
        assert_eq!(all, 5);
    }
}
