//! `modkernel.config.v1`: per-mod configuration entry points.
//!
//! Keys are passed as `category.key`; a bare `key` lands in `general`.

use crate::error::guard;
use crate::records::{copy_out, optional_str, required_str, MkBool, MkConfigValue, MkHandle, MkResult};
use crate::state;
use modkernel_core::config::{ConfigKey, ConfigValue, ValueKind};
use modkernel_core::error::{KernelError, KernelResult, CODE_OK};
use std::ffi::{c_char, c_void, CString};
use std::mem::size_of;

pub type MkConfigVisitFn = extern "C" fn(key: *const c_char, kind: u32, user_data: *mut c_void) -> MkBool;

#[repr(C)]
pub struct MkConfigApiV1 {
    pub struct_size: u32,
    pub version: u32,
    pub get_kind: unsafe extern "C" fn(module: MkHandle, key: *const c_char, out_kind: *mut u32) -> MkResult,
    pub get_bool: unsafe extern "C" fn(module: MkHandle, key: *const c_char, out_value: *mut MkBool) -> MkResult,
    pub get_int: unsafe extern "C" fn(module: MkHandle, key: *const c_char, out_value: *mut i64) -> MkResult,
    pub get_float: unsafe extern "C" fn(module: MkHandle, key: *const c_char, out_value: *mut f64) -> MkResult,
    pub get_string: unsafe extern "C" fn(
        module: MkHandle,
        key: *const c_char,
        buffer: *mut u8,
        capacity: usize,
        out_len: *mut usize,
    ) -> MkResult,
    pub set: unsafe extern "C" fn(module: MkHandle, key: *const c_char, value: *const MkConfigValue) -> MkResult,
    pub reset: unsafe extern "C" fn(module: MkHandle, key: *const c_char) -> MkResult,
    pub enumerate: unsafe extern "C" fn(
        module: MkHandle,
        category: *const c_char,
        visit: Option<MkConfigVisitFn>,
        user_data: *mut c_void,
    ) -> MkResult,
    pub batch_begin: unsafe extern "C" fn(module: MkHandle, out_batch: *mut u64) -> MkResult,
    pub batch_set: unsafe extern "C" fn(
        module: MkHandle,
        batch: u64,
        key: *const c_char,
        value: *const MkConfigValue,
    ) -> MkResult,
    pub batch_commit: extern "C" fn(module: MkHandle, batch: u64) -> MkResult,
    pub batch_discard: extern "C" fn(module: MkHandle, batch: u64) -> MkResult,
    pub flush_and_release: extern "C" fn(module: MkHandle) -> MkResult,
}

pub static CONFIG_API_V1: MkConfigApiV1 = MkConfigApiV1 {
    struct_size: size_of::<MkConfigApiV1>() as u32,
    version: 1,
    get_kind: config_get_kind,
    get_bool: config_get_bool,
    get_int: config_get_int,
    get_float: config_get_float,
    get_string: config_get_string,
    set: config_set,
    reset: config_reset,
    enumerate: config_enumerate,
    batch_begin: config_batch_begin,
    batch_set: config_batch_set,
    batch_commit: config_batch_commit,
    batch_discard: config_batch_discard,
    flush_and_release: config_flush_and_release,
};

unsafe fn parse_key(key: *const c_char) -> KernelResult<ConfigKey> {
    ConfigKey::parse(unsafe { required_str(key, "config key") }?)
}

unsafe fn parse_value(value: *const MkConfigValue) -> KernelResult<ConfigValue> {
    if value.is_null() {
        return Err(KernelError::InvalidArgument("config value is null".to_string()));
    }
    let value = unsafe { *value };
    let kind = ValueKind::from_u32(value.kind)
        .ok_or_else(|| KernelError::InvalidArgument(format!("unknown value kind {}", value.kind)))?;
    Ok(match kind {
        ValueKind::Bool => ConfigValue::Bool(value.bool_value != 0),
        ValueKind::Integer => ConfigValue::Integer(value.int_value),
        ValueKind::Float => ConfigValue::Float(value.float_value),
        ValueKind::String => {
            ConfigValue::String(unsafe { required_str(value.string_value, "string value") }?.to_string())
        }
    })
}

unsafe fn store_out<T>(out: *mut T, value: T) -> KernelResult<()> {
    if out.is_null() {
        return Err(KernelError::InvalidArgument("output pointer is null".to_string()));
    }
    unsafe { *out = value };
    Ok(())
}

/// # Safety
/// `key` must be a NUL-terminated string; `out_kind` must be writable.
pub unsafe extern "C" fn config_get_kind(module: MkHandle, key: *const c_char, out_kind: *mut u32) -> MkResult {
    guard("config.get_kind", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let value = kernel.config().get(&module, &unsafe { parse_key(key) }?)?;
        unsafe { store_out(out_kind, value.kind() as u32) }?;
        Ok(CODE_OK)
    })
}

/// # Safety
/// `key` must be a NUL-terminated string; `out_value` must be writable.
pub unsafe extern "C" fn config_get_bool(module: MkHandle, key: *const c_char, out_value: *mut MkBool) -> MkResult {
    guard("config.get_bool", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let value = kernel.config().get_bool(&module, &unsafe { parse_key(key) }?)?;
        unsafe { store_out(out_value, value as MkBool) }?;
        Ok(CODE_OK)
    })
}

/// # Safety
/// `key` must be a NUL-terminated string; `out_value` must be writable.
pub unsafe extern "C" fn config_get_int(module: MkHandle, key: *const c_char, out_value: *mut i64) -> MkResult {
    guard("config.get_int", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let value = kernel.config().get_int(&module, &unsafe { parse_key(key) }?)?;
        unsafe { store_out(out_value, value) }?;
        Ok(CODE_OK)
    })
}

/// # Safety
/// `key` must be a NUL-terminated string; `out_value` must be writable.
pub unsafe extern "C" fn config_get_float(module: MkHandle, key: *const c_char, out_value: *mut f64) -> MkResult {
    guard("config.get_float", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let value = kernel.config().get_float(&module, &unsafe { parse_key(key) }?)?;
        unsafe { store_out(out_value, value) }?;
        Ok(CODE_OK)
    })
}

/// Copies the UTF-8 string value (without NUL) into `buffer`.
///
/// # Safety
/// `key` must be a NUL-terminated string; `buffer` must hold `capacity`
/// writable bytes.
pub unsafe extern "C" fn config_get_string(
    module: MkHandle,
    key: *const c_char,
    buffer: *mut u8,
    capacity: usize,
    out_len: *mut usize,
) -> MkResult {
    guard("config.get_string", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let value = kernel.config().get_string(&module, &unsafe { parse_key(key) }?)?;
        unsafe { copy_out(value.as_bytes(), buffer, capacity, out_len) }?;
        Ok(CODE_OK)
    })
}

/// # Safety
/// `key` must be a NUL-terminated string; `value` must be readable.
pub unsafe extern "C" fn config_set(module: MkHandle, key: *const c_char, value: *const MkConfigValue) -> MkResult {
    guard("config.set", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let key = unsafe { parse_key(key) }?;
        let value = unsafe { parse_value(value) }?;
        kernel.config().set(&module, &key, value)?;
        Ok(CODE_OK)
    })
}

/// Returns 1 when a stored value was removed, 0 otherwise.
///
/// # Safety
/// `key` must be a NUL-terminated string.
pub unsafe extern "C" fn config_reset(module: MkHandle, key: *const c_char) -> MkResult {
    guard("config.reset", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let removed = kernel.config().reset(&module, &unsafe { parse_key(key) }?)?;
        Ok(removed as MkResult)
    })
}

/// Visits stored entries (optionally one category) until `visit` returns 0.
/// Returns the number of entries visited.
///
/// # Safety
/// `category` must be null or a NUL-terminated string.
pub unsafe extern "C" fn config_enumerate(
    module: MkHandle,
    category: *const c_char,
    visit: Option<MkConfigVisitFn>,
    user_data: *mut c_void,
) -> MkResult {
    let user_data = crate::records::ForeignPtr(user_data);
    guard("config.enumerate", || {
        let visit = visit.ok_or_else(|| KernelError::InvalidArgument("visit is null".to_string()))?;
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let category = unsafe { optional_str(category, "category") }?;
        let visited = kernel.config().enumerate(&module, category, |key, value| {
            let path = CString::new(key.to_string()).unwrap_or_default();
            visit(path.as_ptr(), value.kind() as u32, user_data.get()) != 0
        })?;
        Ok(visited.min(i32::MAX as usize) as MkResult)
    })
}

/// # Safety
/// `out_batch` must be writable.
pub unsafe extern "C" fn config_batch_begin(module: MkHandle, out_batch: *mut u64) -> MkResult {
    guard("config.batch_begin", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        if out_batch.is_null() {
            return Err(KernelError::InvalidArgument("out_batch is null".to_string()));
        }
        let batch = kernel.config().batch_begin(&module);
        unsafe { store_out(out_batch, batch) }?;
        Ok(CODE_OK)
    })
}

/// Returns the number of staged writes.
///
/// # Safety
/// `key` must be a NUL-terminated string; `value` must be readable.
pub unsafe extern "C" fn config_batch_set(
    module: MkHandle,
    batch: u64,
    key: *const c_char,
    value: *const MkConfigValue,
) -> MkResult {
    guard("config.batch_set", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let key = unsafe { parse_key(key) }?;
        let value = unsafe { parse_value(value) }?;
        let staged = kernel.config().batch_set(&module, batch, key, value)?;
        Ok(staged.min(i32::MAX as usize) as MkResult)
    })
}

/// Returns the number of writes applied.
pub extern "C" fn config_batch_commit(module: MkHandle, batch: u64) -> MkResult {
    guard("config.batch_commit", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        let applied = kernel.config().batch_commit(&module, batch)?;
        Ok(applied.min(i32::MAX as usize) as MkResult)
    })
}

pub extern "C" fn config_batch_discard(module: MkHandle, batch: u64) -> MkResult {
    guard("config.batch_discard", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        kernel.config().batch_discard(&module, batch)?;
        Ok(CODE_OK)
    })
}

pub extern "C" fn config_flush_and_release(module: MkHandle) -> MkResult {
    guard("config.flush_and_release", || {
        let kernel = state::kernel()?;
        let module = state::module(&kernel, module)?;
        kernel.config().flush_and_release(&module)?;
        Ok(CODE_OK)
    })
}
