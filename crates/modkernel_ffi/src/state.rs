//! Process-wide kernel instance and the thread-bound default module.
//!
//! # Responsibility
//! - Own the one kernel that C entry points act on.
//! - Resolve a caller-supplied module handle, falling back to the module
//!   bound to the calling thread when the handle is null.

use modkernel_core::capability::CapabilityDescriptor;
use modkernel_core::error::{KernelError, KernelResult};
use modkernel_core::resource::Handle;
use modkernel_core::{Kernel, ModContext};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::Cell;
use std::ffi::c_void;
use std::sync::Arc;

pub const RESOURCE_API_NAME: &str = "modkernel.resource.v1";
pub const IMC_API_NAME: &str = "modkernel.imc.v1";
pub const CONFIG_API_NAME: &str = "modkernel.config.v1";
pub const RESOURCE_API_ID: u32 = 1;
pub const IMC_API_ID: u32 = 2;
pub const CONFIG_API_ID: u32 = 3;

enum Instance {
    Uninitialized,
    Running(Arc<Kernel>),
    ShutDown,
}

static INSTANCE: Lazy<RwLock<Instance>> = Lazy::new(|| RwLock::new(Instance::Uninitialized));

thread_local! {
    static CURRENT_MODULE: Cell<Handle> = const { Cell::new(Handle::NULL) };
}

/// Address of a static API table, stored as a capability row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ApiTable(usize);

impl ApiTable {
    pub fn of<T>(table: &'static T) -> Self {
        Self(table as *const T as usize)
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0 as *const c_void
    }
}

/// Installs `kernel` and publishes the C API tables in its registry.
pub(crate) fn install(kernel: Kernel) -> KernelResult<()> {
    let mut instance = INSTANCE.write();
    if let Instance::Running(_) = *instance {
        return Err(KernelError::AlreadyExists("kernel instance".to_string()));
    }

    let capabilities = kernel.capabilities();
    for (name, id, table) in [
        (RESOURCE_API_NAME, RESOURCE_API_ID, ApiTable::of(&crate::resource_api::RESOURCE_API_V1)),
        (IMC_API_NAME, IMC_API_ID, ApiTable::of(&crate::imc_api::IMC_API_V1)),
        (CONFIG_API_NAME, CONFIG_API_ID, ApiTable::of(&crate::config_api::CONFIG_API_V1)),
    ] {
        capabilities.register(CapabilityDescriptor::new(name, id, 1), Arc::new(table))?;
    }
    *instance = Instance::Running(Arc::new(kernel));
    Ok(())
}

/// Takes the running kernel out of the slot; later calls report
/// `ShuttingDown` until the next `mk_kernel_init`.
pub(crate) fn take_for_shutdown() -> Option<Arc<Kernel>> {
    let mut instance = INSTANCE.write();
    match std::mem::replace(&mut *instance, Instance::ShutDown) {
        Instance::Running(kernel) => Some(kernel),
        Instance::Uninitialized => {
            *instance = Instance::Uninitialized;
            None
        }
        Instance::ShutDown => None,
    }
}

pub(crate) fn kernel() -> KernelResult<Arc<Kernel>> {
    match &*INSTANCE.read() {
        Instance::Running(kernel) => Ok(Arc::clone(kernel)),
        Instance::Uninitialized => Err(KernelError::NotFound(
            "kernel instance (call mk_kernel_init first)".to_string(),
        )),
        Instance::ShutDown => Err(KernelError::ShuttingDown),
    }
}

pub(crate) fn bind_current_module(handle: Handle) {
    CURRENT_MODULE.with(|current| current.set(handle));
}

pub(crate) fn current_module() -> Handle {
    CURRENT_MODULE.with(Cell::get)
}

/// Resolves `handle`, substituting the thread-bound module for null.
pub(crate) fn module(kernel: &Kernel, handle: Handle) -> KernelResult<ModContext> {
    let handle = if handle.is_null() {
        current_module()
    } else {
        handle
    };
    if handle.is_null() {
        return Err(KernelError::InvalidArgument(
            "null module handle and no module bound to this thread".to_string(),
        ));
    }
    kernel.resolve_mod(handle)
}

/// Looks up a published API table by name.
pub(crate) fn api_by_name(name: &str) -> Option<*const c_void> {
    let kernel = kernel().ok()?;
    kernel
        .capabilities()
        .get_as::<ApiTable>(name)
        .map(|table| table.as_ptr())
}

pub(crate) fn api_by_id(id: u32) -> Option<*const c_void> {
    let kernel = kernel().ok()?;
    kernel
        .capabilities()
        .get_by_id_as::<ApiTable>(id)
        .map(|table| table.as_ptr())
}
