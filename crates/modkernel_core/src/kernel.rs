//! Kernel assembly and mod lifecycle.
//!
//! # Responsibility
//! - Build the four services and publish them in the capability registry.
//! - Attach and detach mods, tearing down everything a mod owns.
//!
//! # Invariants
//! - Mod names are unique among attached mods.
//! - A detached mod's handle no longer validates, and it owns no
//!   subscriptions, RPC handlers, open batches or resource types.
//! - After `shutdown` no mod can attach.

use crate::capability::{is_valid_dotted_name, CapabilityDescriptor, CapabilityRegistry};
use crate::config::ConfigStore;
use crate::context::ModContext;
use crate::error::{KernelError, KernelResult};
use crate::imc::ImcBus;
use crate::logging::init_logging;
use crate::resource::{Handle, ResourceRegistry, ResourceTypeDescriptor, ResourceTypeId};
use crate::settings::KernelSettings;
use log::{error, info, warn};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub const MOD_RESOURCE_TYPE: &str = "modkernel.mod";
pub const RESOURCES_CAPABILITY: &str = "modkernel.core.resources";
pub const IMC_CAPABILITY: &str = "modkernel.core.imc";
pub const CONFIG_CAPABILITY: &str = "modkernel.core.config";
pub const RESOURCES_CAPABILITY_ID: u32 = 100;
pub const IMC_CAPABILITY_ID: u32 = 101;
pub const CONFIG_CAPABILITY_ID: u32 = 102;

/// One kernel instance: services plus the table of attached mods.
pub struct Kernel {
    settings: KernelSettings,
    resources: ResourceRegistry,
    capabilities: CapabilityRegistry,
    config: Arc<ConfigStore>,
    bus: ImcBus,
    mod_type: ResourceTypeId,
    mods: RwLock<BTreeMap<String, ModContext>>,
    shutting_down: AtomicBool,
}

impl Kernel {
    /// Builds a kernel from validated settings.
    ///
    /// Starts file logging first when `settings.log_dir` is set.
    pub fn new(settings: KernelSettings) -> KernelResult<Self> {
        settings.validate()?;
        if let Some(log_dir) = &settings.log_dir {
            init_logging(&settings.log_level, log_dir)
                .map_err(KernelError::InvalidArgument)?;
        }

        let resources = ResourceRegistry::new();
        let mod_type = resources.register_type(
            ResourceTypeDescriptor::new(MOD_RESOURCE_TYPE).with_finalizer(|finalized| {
                info!(
                    "event=mod_release module=kernel status=ok handle={}",
                    finalized.handle
                );
            }),
        )?;
        let config = Arc::new(ConfigStore::new(settings.config_dir.clone()));
        let bus = ImcBus::new(settings.default_queue_capacity, settings.block_timeout());

        let capabilities = CapabilityRegistry::new();
        capabilities.register(
            CapabilityDescriptor::new(RESOURCES_CAPABILITY, RESOURCES_CAPABILITY_ID, 1),
            Arc::new(resources.clone()),
        )?;
        capabilities.register(
            CapabilityDescriptor::new(IMC_CAPABILITY, IMC_CAPABILITY_ID, 1),
            Arc::new(bus.clone()),
        )?;
        capabilities.register(
            CapabilityDescriptor::new(CONFIG_CAPABILITY, CONFIG_CAPABILITY_ID, 1),
            Arc::clone(&config) as Arc<dyn std::any::Any + Send + Sync>,
        )?;

        info!(
            "event=kernel_init module=kernel status=ok config_dir={} queue_capacity={} block_timeout_ms={}",
            settings.config_dir.display(),
            settings.default_queue_capacity,
            settings.block_timeout_ms
        );
        Ok(Self {
            settings,
            resources,
            capabilities,
            config,
            bus,
            mod_type,
            mods: RwLock::new(BTreeMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &KernelSettings {
        &self.settings
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn bus(&self) -> &ImcBus {
        &self.bus
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Attaches a mod and issues its handle.
    ///
    /// # Errors
    /// - `InvalidArgument` for a name that is not a lowercase dotted name.
    /// - `AlreadyExists` when a mod with that name is attached.
    /// - `ShuttingDown` after `shutdown`.
    pub fn attach_mod(&self, name: &str) -> KernelResult<ModContext> {
        if self.is_shutting_down() {
            return Err(KernelError::ShuttingDown);
        }
        if !is_valid_dotted_name(name) {
            return Err(KernelError::InvalidArgument(format!(
                "mod name is invalid: {name:?}"
            )));
        }

        let mut mods = self.mods.write();
        if self.is_shutting_down() {
            return Err(KernelError::ShuttingDown);
        }
        if mods.contains_key(name) {
            return Err(KernelError::AlreadyExists(format!("mod `{name}`")));
        }
        let handle = self.resources.create(self.mod_type)?;
        let context = ModContext::new(handle, name);
        mods.insert(name.to_string(), context.clone());
        drop(mods);

        info!(
            "event=mod_attach module=kernel status=ok mod={} handle={}",
            name, handle
        );
        Ok(context)
    }

    /// Looks up an attached mod by handle.
    pub fn resolve_mod(&self, handle: Handle) -> KernelResult<ModContext> {
        self.resources.check_type(handle, self.mod_type)?;
        self.mods
            .read()
            .values()
            .find(|context| context.handle() == handle)
            .cloned()
            .ok_or(KernelError::InvalidHandle(handle))
    }

    pub fn attached_mods(&self) -> Vec<ModContext> {
        self.mods.read().values().cloned().collect()
    }

    /// Detaches a mod and releases everything it owns.
    ///
    /// Teardown always runs to completion; a config flush failure is
    /// reported afterwards and the unsaved document is dropped.
    pub fn detach_mod(&self, module: &ModContext) -> KernelResult<()> {
        let started_at = Instant::now();
        {
            let mut mods = self.mods.write();
            match mods.get(module.name()) {
                Some(attached) if attached == module => {
                    mods.remove(module.name());
                }
                _ => {
                    return Err(KernelError::NotFound(format!(
                        "attached mod `{}`",
                        module.name()
                    )))
                }
            }
        }

        let flushed = self.config.flush_and_release(module);
        if let Err(err) = &flushed {
            error!(
                "event=mod_detach module=kernel status=error mod={} step=config_flush error_code={} error={}",
                module.name(),
                err.code(),
                err
            );
            self.config.drop_cached(module);
        }
        let batches = self.config.discard_batches_owned_by(module);
        let subscriptions = self.bus.unsubscribe_owned_by(module);
        let rpcs = self.bus.unregister_rpcs_owned_by(module);
        let types = self.resources.retire_types_owned_by(module.handle());
        if let Err(err) = self.resources.release(module.handle()) {
            warn!(
                "event=mod_detach module=kernel status=error mod={} step=release_handle error_code={}",
                module.name(),
                err.code()
            );
        }

        info!(
            "event=mod_detach module=kernel status=ok mod={} batches={} subscriptions={} rpcs={} types={} duration_ms={}",
            module.name(),
            batches,
            subscriptions,
            rpcs,
            types,
            started_at.elapsed().as_millis()
        );
        flushed
    }

    /// Detaches every mod, cancels outstanding RPC futures and refuses
    /// further attaches. Repeated calls are no-ops.
    pub fn shutdown(&self) -> KernelResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("event=kernel_shutdown module=kernel status=start");

        let mut first_error = None;
        for module in self.attached_mods() {
            if let Err(err) = self.detach_mod(&module) {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        let cancelled = self.bus.cancel_pending_rpcs();

        info!(
            "event=kernel_shutdown module=kernel status=ok cancelled_futures={}",
            cancelled
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(
                "event=kernel_drop module=kernel status=error error_code={}",
                err.code()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Kernel, CONFIG_CAPABILITY, IMC_CAPABILITY_ID};
    use crate::config::ConfigStore;
    use crate::error::KernelError;
    use crate::imc::ImcBus;
    use crate::settings::KernelSettings;

    fn kernel(dir: &tempfile::TempDir) -> Kernel {
        Kernel::new(KernelSettings::with_config_dir(dir.path())).expect("kernel")
    }

    #[test]
    fn publishes_core_services_as_capabilities() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = kernel(&dir);
        assert!(kernel
            .capabilities()
            .get_as::<ConfigStore>(CONFIG_CAPABILITY)
            .is_some());
        assert!(kernel
            .capabilities()
            .get_by_id_as::<ImcBus>(IMC_CAPABILITY_ID)
            .is_some());
    }

    #[test]
    fn rejects_invalid_and_duplicate_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = kernel(&dir);
        assert!(matches!(
            kernel.attach_mod("Bad Name"),
            Err(KernelError::InvalidArgument(_))
        ));
        kernel.attach_mod("audio.mixer").expect("attach");
        assert!(matches!(
            kernel.attach_mod("audio.mixer"),
            Err(KernelError::AlreadyExists(_))
        ));
    }

    #[test]
    fn detach_invalidates_handle_and_allows_reattach() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = kernel(&dir);
        let first = kernel.attach_mod("physics").expect("attach");
        kernel.detach_mod(&first).expect("detach");

        assert!(!kernel.resources().validate(first.handle()));
        assert!(matches!(
            kernel.resolve_mod(first.handle()),
            Err(KernelError::InvalidHandle(_))
        ));
        assert!(matches!(
            kernel.detach_mod(&first),
            Err(KernelError::NotFound(_))
        ));

        let second = kernel.attach_mod("physics").expect("reattach");
        assert_ne!(first.handle(), second.handle());
        assert_eq!(
            kernel.resolve_mod(second.handle()).expect("resolve"),
            second
        );
    }

    #[test]
    fn shutdown_is_idempotent_and_blocks_attach() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kernel = kernel(&dir);
        kernel.attach_mod("ui").expect("attach");

        kernel.shutdown().expect("shutdown");
        kernel.shutdown().expect("second shutdown");
        assert!(kernel.attached_mods().is_empty());
        assert!(matches!(
            kernel.attach_mod("ui"),
            Err(KernelError::ShuttingDown)
        ));
    }
}
