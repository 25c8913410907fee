//! `modkernel.resource.v1`: handle registry entry points.

use crate::error::guard;
use crate::records::{read_record, ForeignPtr, MkBool, MkHandle, MkResourceTypeDesc, MkResult};
use crate::state;
use modkernel_core::error::{KernelError, CODE_OK};
use modkernel_core::resource::{FinalizedResource, ResourceTypeDescriptor};
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::Arc;

#[repr(C)]
pub struct MkResourceApiV1 {
    pub struct_size: u32,
    pub version: u32,
    pub register_type:
        unsafe extern "C" fn(module: MkHandle, desc: *const MkResourceTypeDesc, out_type: *mut u32) -> MkResult,
    pub create: unsafe extern "C" fn(type_id: u32, out_handle: *mut MkHandle) -> MkResult,
    pub retain: extern "C" fn(handle: MkHandle) -> MkResult,
    pub release: extern "C" fn(handle: MkHandle) -> MkResult,
    pub validate: extern "C" fn(handle: MkHandle) -> MkBool,
    pub attach_user_data: extern "C" fn(handle: MkHandle, user_data: *mut c_void) -> MkResult,
    pub get_user_data: unsafe extern "C" fn(handle: MkHandle, out_user_data: *mut *mut c_void) -> MkResult,
}

pub static RESOURCE_API_V1: MkResourceApiV1 = MkResourceApiV1 {
    struct_size: size_of::<MkResourceApiV1>() as u32,
    version: 1,
    register_type: resource_register_type,
    create: resource_create,
    retain: resource_retain,
    release: resource_release,
    validate: resource_validate,
    attach_user_data: resource_attach_user_data,
    get_user_data: resource_get_user_data,
};

fn foreign(data: Option<&modkernel_core::resource::UserData>) -> *mut c_void {
    data.and_then(|data| data.downcast_ref::<ForeignPtr>())
        .map(|ptr| ptr.get())
        .unwrap_or(std::ptr::null_mut())
}

/// Registers a resource type owned by `module` (null = thread default).
///
/// # Safety
/// `desc` must follow the size-prefixed record contract and `out_type` must
/// be writable.
pub unsafe extern "C" fn resource_register_type(
    module: MkHandle,
    desc: *const MkResourceTypeDesc,
    out_type: *mut u32,
) -> MkResult {
    guard("resource.register_type", || {
        let kernel = state::kernel()?;
        let owner = state::module(&kernel, module)?;
        let desc = unsafe { read_record(desc, "resource type descriptor") }?;
        let name = unsafe { crate::records::required_str(desc.name, "resource type name") }?;
        if out_type.is_null() {
            return Err(KernelError::InvalidArgument("out_type is null".to_string()));
        }

        let mut descriptor = ResourceTypeDescriptor::new(name).owned_by(owner.handle());
        if !desc.context.is_null() {
            descriptor = descriptor.with_context(Arc::new(ForeignPtr(desc.context)));
        }
        if let Some(finalizer) = desc.finalizer {
            descriptor = descriptor.with_finalizer(move |finalized: &FinalizedResource| {
                finalizer(
                    finalized.handle,
                    foreign(finalized.user_data.as_ref()),
                    foreign(finalized.context.as_ref()),
                );
            });
        }
        let type_id = kernel.resources().register_type(descriptor)?;
        unsafe { *out_type = type_id };
        Ok(CODE_OK)
    })
}

/// # Safety
/// `out_handle` must be writable.
pub unsafe extern "C" fn resource_create(type_id: u32, out_handle: *mut MkHandle) -> MkResult {
    guard("resource.create", || {
        if out_handle.is_null() {
            return Err(KernelError::InvalidArgument("out_handle is null".to_string()));
        }
        let handle = state::kernel()?.resources().create(type_id)?;
        unsafe { *out_handle = handle };
        Ok(CODE_OK)
    })
}

/// Returns the new reference count.
pub extern "C" fn resource_retain(handle: MkHandle) -> MkResult {
    guard("resource.retain", || {
        let count = state::kernel()?.resources().retain(handle)?;
        Ok(count.min(i32::MAX as u32) as MkResult)
    })
}

/// Returns the remaining reference count; `0` means the finalizer ran.
pub extern "C" fn resource_release(handle: MkHandle) -> MkResult {
    guard("resource.release", || {
        let count = state::kernel()?.resources().release(handle)?;
        Ok(count.min(i32::MAX as u32) as MkResult)
    })
}

pub extern "C" fn resource_validate(handle: MkHandle) -> MkBool {
    let valid = guard("resource.validate", || {
        Ok(state::kernel()?.resources().validate(handle) as MkResult)
    });
    (valid == 1) as MkBool
}

/// Attaches an opaque pointer; null clears it.
pub extern "C" fn resource_attach_user_data(handle: MkHandle, user_data: *mut c_void) -> MkResult {
    let data = ForeignPtr(user_data);
    guard("resource.attach_user_data", || {
        let value = if data.get().is_null() {
            None
        } else {
            Some(Arc::new(data) as modkernel_core::resource::UserData)
        };
        state::kernel()?.resources().attach_user_data(handle, value)?;
        Ok(CODE_OK)
    })
}

/// # Safety
/// `out_user_data` must be writable.
pub unsafe extern "C" fn resource_get_user_data(handle: MkHandle, out_user_data: *mut *mut c_void) -> MkResult {
    guard("resource.get_user_data", || {
        if out_user_data.is_null() {
            return Err(KernelError::InvalidArgument("out_user_data is null".to_string()));
        }
        let data = state::kernel()?.resources().user_data(handle)?;
        unsafe { *out_user_data = foreign(data.as_ref()) };
        Ok(CODE_OK)
    })
}
