//! Size-prefixed `#[repr(C)]` records exchanged with C callers.
//!
//! # Invariants
//! - Every record starts with `struct_size: u32` filled in by the caller.
//! - Input records smaller than their minimum are rejected; fields past the
//!   declared size take their defaults; a larger size is accepted and the
//!   unknown tail is ignored.
//! - Output records are written only up to the caller's declared size.

use modkernel_core::error::{KernelError, KernelResult};
use modkernel_core::imc::ImcStats;
use modkernel_core::resource::Handle;
use std::ffi::{c_char, c_void, CStr};
use std::mem::{offset_of, size_of};

pub type MkResult = i32;
pub type MkBool = u32;
pub type MkHandle = Handle;

pub type MkFinalizerFn = extern "C" fn(handle: MkHandle, user_data: *mut c_void, context: *mut c_void);

/// Resource type registration record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MkResourceTypeDesc {
    pub struct_size: u32,
    pub name: *const c_char,
    pub finalizer: Option<MkFinalizerFn>,
    pub context: *mut c_void,
}

/// Publish metadata. `flags` defaults to 0 for callers built before it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MkMessageMeta {
    pub struct_size: u32,
    pub priority: u32,
    pub flags: u32,
}

/// One message as seen by a C subscriber. Valid for the duration of the call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MkMessage {
    pub struct_size: u32,
    pub topic: u32,
    pub sender: MkHandle,
    pub sequence: u64,
    pub priority: u32,
    pub flags: u32,
    pub data: *const u8,
    pub len: usize,
}

pub type MkMessageHandlerFn = extern "C" fn(message: *const MkMessage, user_data: *mut c_void);
pub type MkMessageFilterFn = extern "C" fn(message: *const MkMessage, user_data: *mut c_void) -> MkBool;

/// Extended subscription options. Zero capacity or timeout means the bus
/// default.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MkSubscribeOptions {
    pub struct_size: u32,
    pub capacity: u32,
    pub policy: u32,
    pub min_priority: u32,
    pub block_timeout_ms: u32,
    pub filter: Option<MkMessageFilterFn>,
}

/// Bus counters snapshot. Written up to the caller's `struct_size`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MkImcStats {
    pub struct_size: u32,
    pub reserved: u32,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub filtered: u64,
    pub rejected: u64,
    pub rpc_calls: u64,
    pub rpc_completed: u64,
    pub rpc_failed: u64,
    pub active_subscriptions: u64,
    pub registered_rpcs: u64,
}

/// Typed configuration value passed into `set` and `batch_set`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MkConfigValue {
    pub kind: u32,
    pub bool_value: MkBool,
    pub int_value: i64,
    pub float_value: f64,
    pub string_value: *const c_char,
}

/// Filled by `mk_attach`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MkAttachInfo {
    pub struct_size: u32,
    pub module: MkHandle,
    pub get_api: Option<extern "C" fn(name: *const c_char) -> *const c_void>,
    pub get_api_by_id: Option<extern "C" fn(id: u32) -> *const c_void>,
}

/// Layout rules of one size-prefixed input record.
pub(crate) trait SizedRecord: Copy {
    /// Smallest `struct_size` a caller may declare.
    const MIN_SIZE: usize;

    fn defaults() -> Self;

    /// Restores defaults for fields that end past `declared` bytes.
    fn clear_beyond(&mut self, declared: usize);
}

fn field_fits(offset: usize, width: usize, declared: usize) -> bool {
    offset + width <= declared
}

impl SizedRecord for MkResourceTypeDesc {
    const MIN_SIZE: usize = offset_of!(MkResourceTypeDesc, name) + size_of::<*const c_char>();

    fn defaults() -> Self {
        Self {
            struct_size: size_of::<Self>() as u32,
            name: std::ptr::null(),
            finalizer: None,
            context: std::ptr::null_mut(),
        }
    }

    fn clear_beyond(&mut self, declared: usize) {
        let defaults = Self::defaults();
        if !field_fits(offset_of!(Self, finalizer), size_of::<Option<MkFinalizerFn>>(), declared) {
            self.finalizer = defaults.finalizer;
        }
        if !field_fits(offset_of!(Self, context), size_of::<*mut c_void>(), declared) {
            self.context = defaults.context;
        }
    }
}

impl SizedRecord for MkMessageMeta {
    const MIN_SIZE: usize = offset_of!(MkMessageMeta, priority) + size_of::<u32>();

    fn defaults() -> Self {
        Self {
            struct_size: size_of::<Self>() as u32,
            priority: 1,
            flags: 0,
        }
    }

    fn clear_beyond(&mut self, declared: usize) {
        if !field_fits(offset_of!(Self, flags), size_of::<u32>(), declared) {
            self.flags = 0;
        }
    }
}

impl SizedRecord for MkSubscribeOptions {
    const MIN_SIZE: usize = offset_of!(MkSubscribeOptions, policy) + size_of::<u32>();

    fn defaults() -> Self {
        Self {
            struct_size: size_of::<Self>() as u32,
            capacity: 0,
            policy: 0,
            min_priority: 0,
            block_timeout_ms: 0,
            filter: None,
        }
    }

    fn clear_beyond(&mut self, declared: usize) {
        let defaults = Self::defaults();
        if !field_fits(offset_of!(Self, min_priority), size_of::<u32>(), declared) {
            self.min_priority = defaults.min_priority;
        }
        if !field_fits(offset_of!(Self, block_timeout_ms), size_of::<u32>(), declared) {
            self.block_timeout_ms = defaults.block_timeout_ms;
        }
        if !field_fits(offset_of!(Self, filter), size_of::<Option<MkMessageFilterFn>>(), declared) {
            self.filter = defaults.filter;
        }
    }
}

/// Copies a caller record into a full-size local, honoring its declared size.
///
/// # Safety
/// `ptr` must be null or point to at least `struct_size` readable bytes, where
/// `struct_size` is the record's first field.
pub(crate) unsafe fn read_record<T: SizedRecord>(ptr: *const T, what: &str) -> KernelResult<T> {
    if ptr.is_null() {
        return Err(KernelError::InvalidArgument(format!("{what} is null")));
    }
    let declared = unsafe { std::ptr::read_unaligned(ptr as *const u32) } as usize;
    if declared < T::MIN_SIZE {
        return Err(KernelError::InvalidArgument(format!(
            "{what} struct_size {declared} is below the minimum {}",
            T::MIN_SIZE
        )));
    }

    let mut record = T::defaults();
    let copied = declared.min(size_of::<T>());
    unsafe {
        std::ptr::copy_nonoverlapping(
            ptr as *const u8,
            &mut record as *mut T as *mut u8,
            copied,
        );
    }
    record.clear_beyond(declared);
    Ok(record)
}

/// Writes `value` into a caller-sized output record.
///
/// # Safety
/// `out` must be null or point to at least `struct_size` writable bytes,
/// where `struct_size` is the record's first field, set by the caller.
pub(crate) unsafe fn write_record<T: Copy>(out: *mut T, value: &T, min_size: usize, what: &str) -> KernelResult<()> {
    if out.is_null() {
        return Err(KernelError::InvalidArgument(format!("{what} is null")));
    }
    let declared = unsafe { std::ptr::read_unaligned(out as *const u32) } as usize;
    if declared < min_size {
        return Err(KernelError::InvalidArgument(format!(
            "{what} struct_size {declared} is below the minimum {min_size}"
        )));
    }
    let written = declared.min(size_of::<T>());
    unsafe {
        std::ptr::copy_nonoverlapping(value as *const T as *const u8, out as *mut u8, written);
        std::ptr::write_unaligned(out as *mut u32, written as u32);
    }
    Ok(())
}

impl From<ImcStats> for MkImcStats {
    fn from(stats: ImcStats) -> Self {
        Self {
            struct_size: size_of::<Self>() as u32,
            reserved: 0,
            published: stats.published,
            delivered: stats.delivered,
            dropped: stats.dropped,
            filtered: stats.filtered,
            rejected: stats.rejected,
            rpc_calls: stats.rpc_calls,
            rpc_completed: stats.rpc_completed,
            rpc_failed: stats.rpc_failed,
            active_subscriptions: stats.active_subscriptions,
            registered_rpcs: stats.registered_rpcs,
        }
    }
}

pub(crate) const MK_IMC_STATS_MIN_SIZE: usize = offset_of!(MkImcStats, published) + size_of::<u64>();
pub(crate) const MK_ATTACH_INFO_MIN_SIZE: usize = size_of::<MkAttachInfo>();

/// Borrows a required NUL-terminated UTF-8 argument.
///
/// # Safety
/// `ptr` must be null or a valid NUL-terminated string that outlives the call.
pub(crate) unsafe fn required_str<'a>(ptr: *const c_char, what: &str) -> KernelResult<&'a str> {
    if ptr.is_null() {
        return Err(KernelError::InvalidArgument(format!("{what} is null")));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| KernelError::InvalidArgument(format!("{what} is not valid UTF-8")))
}

/// Like [`required_str`], with null mapping to `None`.
///
/// # Safety
/// Same as [`required_str`].
pub(crate) unsafe fn optional_str<'a>(ptr: *const c_char, what: &str) -> KernelResult<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { required_str(ptr, what) }.map(Some)
}

/// Borrows `len` bytes; a null pointer is only accepted with `len == 0`.
///
/// # Safety
/// `ptr` must point to `len` readable bytes that outlive the call.
pub(crate) unsafe fn byte_slice<'a>(ptr: *const u8, len: usize, what: &str) -> KernelResult<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(KernelError::InvalidArgument(format!("{what} is null")));
    }
    Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
}

/// Copies `bytes` into a caller buffer and reports the full length.
///
/// A buffer shorter than `bytes` receives a truncated copy and the call is
/// reported as `InvalidArgument`, so callers can retry with `*out_len` bytes.
///
/// # Safety
/// `buffer` must point to `capacity` writable bytes (or be null with zero
/// capacity); `out_len` must be null or writable.
pub(crate) unsafe fn copy_out(bytes: &[u8], buffer: *mut u8, capacity: usize, out_len: *mut usize) -> KernelResult<()> {
    if !out_len.is_null() {
        unsafe { *out_len = bytes.len() };
    }
    let copied = bytes.len().min(capacity);
    if copied > 0 {
        if buffer.is_null() {
            return Err(KernelError::InvalidArgument("output buffer is null".to_string()));
        }
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, copied) };
    }
    if copied < bytes.len() {
        return Err(KernelError::InvalidArgument(format!(
            "output buffer holds {capacity} bytes, {} needed",
            bytes.len()
        )));
    }
    Ok(())
}

/// C-supplied pointer carried through Rust closures and user data.
///
/// The caller that hands the pointer over guarantees it may be used from
/// any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ForeignPtr(pub *mut c_void);

// SAFETY: the pointer is opaque to Rust and only handed back to C; thread
// safety of the pointee is the C caller's contract.
unsafe impl Send for ForeignPtr {}
unsafe impl Sync for ForeignPtr {}

impl ForeignPtr {
    pub fn get(self) -> *mut c_void {
        self.0
    }
}
