//! Process-level C entry points.
//!
//! # Responsibility
//! - Start and stop the process kernel and attach/detach mods.
//! - Expose the thread-local last error and the thread-bound module.
//!
//! # Invariants
//! - Exported functions must not panic across the FFI boundary.
//! - Every function returns a `ResultCode` (or a value that cannot fail);
//!   detail is read back with `mk_last_error_*`.

use crate::error::{guard, last_code, last_field};
use crate::records::{
    optional_str, required_str, write_record, MkAttachInfo, MkHandle, MkResult, MK_ATTACH_INFO_MIN_SIZE,
};
use crate::state;
use modkernel_core::error::{KernelError, CODE_OK};
use modkernel_core::settings::KernelSettings;
use modkernel_core::Kernel;
use std::ffi::{c_char, c_void};
use std::mem::size_of;
use std::path::PathBuf;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// Kernel version as a static NUL-terminated string.
#[no_mangle]
pub extern "C" fn mk_core_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

/// Creates the process kernel.
///
/// Input semantics:
/// - `config_dir`: directory holding one `<mod>.toml` per mod.
/// - `log_dir`: null to leave logging to the host, otherwise the directory
///   for rolling log files.
/// - `log_level`: null for the default, else `trace|debug|info|warn|error`.
///
/// `MODKERNEL_*` environment variables override the arguments. Calling it
/// while a kernel is running is `AlreadyExists`.
///
/// # Safety
/// Non-null arguments must be NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn mk_kernel_init(
    config_dir: *const c_char,
    log_dir: *const c_char,
    log_level: *const c_char,
) -> MkResult {
    guard("mk_kernel_init", || {
        let config_dir = unsafe { required_str(config_dir, "config_dir") }?;
        let log_dir = unsafe { optional_str(log_dir, "log_dir") }?;
        let log_level = unsafe { optional_str(log_level, "log_level") }?;

        let mut settings = KernelSettings::with_config_dir(config_dir);
        if let Some(level) = log_level {
            settings.log_level = level.to_string();
        }
        settings.log_dir = log_dir.map(PathBuf::from);
        let settings = settings.with_overrides(|name| std::env::var(name).ok())?;

        state::install(Kernel::new(settings)?)?;
        Ok(CODE_OK)
    })
}

extern "C" fn attach_get_api(name: *const c_char) -> *const c_void {
    let name = match unsafe { required_str(name, "api name") } {
        Ok(name) => name,
        Err(_) => return std::ptr::null(),
    };
    state::api_by_name(name).unwrap_or(std::ptr::null())
}

extern "C" fn attach_get_api_by_id(id: u32) -> *const c_void {
    state::api_by_id(id).unwrap_or(std::ptr::null())
}

/// Attaches a mod and fills `out_info` up to its declared size.
///
/// # Safety
/// `name` must be a NUL-terminated string; `out_info` must point to a
/// record whose `struct_size` the caller set.
#[no_mangle]
pub unsafe extern "C" fn mk_attach(name: *const c_char, out_info: *mut MkAttachInfo) -> MkResult {
    guard("mk_attach", || {
        let name = unsafe { required_str(name, "mod name") }?;
        if out_info.is_null() {
            return Err(KernelError::InvalidArgument("out_info is null".to_string()));
        }
        let kernel = state::kernel()?;
        let module = kernel.attach_mod(name)?;
        let info = MkAttachInfo {
            struct_size: size_of::<MkAttachInfo>() as u32,
            module: module.handle(),
            get_api: Some(attach_get_api),
            get_api_by_id: Some(attach_get_api_by_id),
        };
        if let Err(err) = unsafe { write_record(out_info, &info, MK_ATTACH_INFO_MIN_SIZE, "out_info") } {
            kernel.detach_mod(&module)?;
            return Err(err);
        }
        Ok(CODE_OK)
    })
}

/// Ends a mod's validity period and releases everything it owns. A config
/// flush failure is reported after teardown completed.
#[no_mangle]
pub extern "C" fn mk_detach(module: MkHandle) -> MkResult {
    guard("mk_detach", || {
        let kernel = state::kernel()?;
        let context = kernel.resolve_mod(module)?;
        if state::current_module() == module {
            state::bind_current_module(MkHandle::NULL);
        }
        kernel.detach_mod(&context)?;
        Ok(CODE_OK)
    })
}

/// Binds the module used when an entry point receives the null handle on
/// this thread. Passing the null handle clears the binding.
#[no_mangle]
pub extern "C" fn mk_bind_current_module(module: MkHandle) -> MkResult {
    guard("mk_bind_current_module", || {
        if !module.is_null() {
            state::kernel()?.resolve_mod(module)?;
        }
        state::bind_current_module(module);
        Ok(CODE_OK)
    })
}

/// Detaches every mod and cancels pending futures. Further calls report
/// `ShuttingDown` until `mk_kernel_init` runs again.
#[no_mangle]
pub extern "C" fn mk_notify_shutdown() -> MkResult {
    guard("mk_notify_shutdown", || {
        state::bind_current_module(MkHandle::NULL);
        match state::take_for_shutdown() {
            Some(kernel) => {
                kernel.shutdown()?;
                Ok(CODE_OK)
            }
            None => Ok(CODE_OK),
        }
    })
}

/// Code of the last failed call on this thread, `0` after a success.
#[no_mangle]
pub extern "C" fn mk_last_error_code() -> MkResult {
    last_code()
}

/// Message of the last failure. Valid until the next call on this thread.
#[no_mangle]
pub extern "C" fn mk_last_error_message() -> *const c_char {
    last_field(|error| &error.message)
}

/// Name of the entry point that failed last.
#[no_mangle]
pub extern "C" fn mk_last_error_api() -> *const c_char {
    last_field(|error| &error.api)
}

/// `file:line` of the failing entry point.
#[no_mangle]
pub extern "C" fn mk_last_error_location() -> *const c_char {
    last_field(|error| &error.location)
}
