//! `modkernel.imc.v1`: publish/subscribe, RPC and future entry points.
//!
//! # Invariants
//! - Handlers, filters and callbacks receive pointers valid only for the
//!   duration of the call.
//! - `MkFuture` is owned by the caller from `call_rpc` until
//!   `future_release`.

use crate::error::guard;
use crate::records::{
    byte_slice, copy_out, read_record, required_str, write_record, ForeignPtr, MkHandle,
    MkImcStats, MkMessage, MkMessageFilterFn, MkMessageHandlerFn, MkMessageMeta, MkResult,
    MkSubscribeOptions, MK_IMC_STATS_MIN_SIZE,
};
use crate::state;
use modkernel_core::error::{KernelError, KernelResult, CODE_OK};
use modkernel_core::imc::{
    BackpressurePolicy, CallOptions, FutureState, Message, MessageMetadata, Priority, RpcFuture,
    RpcRequest, SubscribeOptions,
};
use std::ffi::{c_char, c_void};
use std::mem::size_of;
use std::time::Duration;

/// `call_rpc` flag: queue the call for `pump` instead of running it inline.
pub const MK_CALL_DEFERRED: u32 = 1;

/// One RPC call as seen by a C handler.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MkRpcRequest {
    pub struct_size: u32,
    pub rpc: u32,
    pub caller: MkHandle,
    pub data: *const u8,
    pub len: usize,
}

/// Response sink handed to an RPC handler; filled with `response_set`.
pub struct MkRpcResponse {
    bytes: Vec<u8>,
}

/// Caller-owned future returned by `call_rpc`.
pub struct MkFuture {
    inner: RpcFuture,
}

pub type MkRpcHandlerFn =
    extern "C" fn(request: *const MkRpcRequest, response: *mut MkRpcResponse, user_data: *mut c_void) -> MkResult;
pub type MkCleanupFn = extern "C" fn(user_data: *mut c_void);
pub type MkCompletionFn = extern "C" fn(state: u32, user_data: *mut c_void);

#[repr(C)]
pub struct MkImcApiV1 {
    pub struct_size: u32,
    pub version: u32,
    pub get_topic_id: unsafe extern "C" fn(name: *const c_char, out_topic: *mut u32) -> MkResult,
    pub get_rpc_id: unsafe extern "C" fn(name: *const c_char, out_rpc: *mut u32) -> MkResult,
    pub publish: unsafe extern "C" fn(
        module: MkHandle,
        topic: u32,
        data: *const u8,
        len: usize,
        meta: *const MkMessageMeta,
    ) -> MkResult,
    pub publish_buffer: unsafe extern "C" fn(
        module: MkHandle,
        topic: u32,
        data: *const u8,
        len: usize,
        cleanup: Option<MkCleanupFn>,
        cleanup_data: *mut c_void,
        meta: *const MkMessageMeta,
    ) -> MkResult,
    pub subscribe: unsafe extern "C" fn(
        module: MkHandle,
        topic: u32,
        handler: Option<MkMessageHandlerFn>,
        user_data: *mut c_void,
        out_subscription: *mut u64,
    ) -> MkResult,
    pub subscribe_ex: unsafe extern "C" fn(
        module: MkHandle,
        topic: u32,
        handler: Option<MkMessageHandlerFn>,
        user_data: *mut c_void,
        options: *const MkSubscribeOptions,
        out_subscription: *mut u64,
    ) -> MkResult,
    pub unsubscribe: extern "C" fn(subscription: u64) -> MkResult,
    pub pump: extern "C" fn(max_per_subscription: u32) -> MkResult,
    pub register_rpc: extern "C" fn(
        module: MkHandle,
        rpc: u32,
        handler: Option<MkRpcHandlerFn>,
        user_data: *mut c_void,
    ) -> MkResult,
    pub unregister_rpc: extern "C" fn(module: MkHandle, rpc: u32) -> MkResult,
    pub call_rpc: unsafe extern "C" fn(
        module: MkHandle,
        rpc: u32,
        data: *const u8,
        len: usize,
        flags: u32,
        out_future: *mut *mut MkFuture,
    ) -> MkResult,
    pub response_set: unsafe extern "C" fn(response: *mut MkRpcResponse, data: *const u8, len: usize) -> MkResult,
    pub future_await: unsafe extern "C" fn(future: *const MkFuture, timeout_ms: u32) -> MkResult,
    pub future_get_state: unsafe extern "C" fn(future: *const MkFuture) -> MkResult,
    pub future_get_result: unsafe extern "C" fn(
        future: *const MkFuture,
        buffer: *mut u8,
        capacity: usize,
        out_len: *mut usize,
    ) -> MkResult,
    pub future_cancel: unsafe extern "C" fn(future: *const MkFuture) -> MkResult,
    pub future_on_complete: unsafe extern "C" fn(
        future: *const MkFuture,
        callback: Option<MkCompletionFn>,
        user_data: *mut c_void,
    ) -> MkResult,
    pub future_release: unsafe extern "C" fn(future: *mut MkFuture),
    pub get_stats: unsafe extern "C" fn(out_stats: *mut MkImcStats) -> MkResult,
    pub reset_stats: extern "C" fn() -> MkResult,
}

pub static IMC_API_V1: MkImcApiV1 = MkImcApiV1 {
    struct_size: size_of::<MkImcApiV1>() as u32,
    version: 1,
    get_topic_id: imc_get_topic_id,
    get_rpc_id: imc_get_rpc_id,
    publish: imc_publish,
    publish_buffer: imc_publish_buffer,
    subscribe: imc_subscribe,
    subscribe_ex: imc_subscribe_ex,
    unsubscribe: imc_unsubscribe,
    pump: imc_pump,
    register_rpc: imc_register_rpc,
    unregister_rpc: imc_unregister_rpc,
    call_rpc: imc_call_rpc,
    response_set: imc_response_set,
    future_await: imc_future_await,
    future_get_state: imc_future_get_state,
    future_get_result: imc_future_get_result,
    future_cancel: imc_future_cancel,
    future_on_complete: imc_future_on_complete,
    future_release: imc_future_release,
    get_stats: imc_get_stats,
    reset_stats: imc_reset_stats,
};

fn as_c_message(message: &Message) -> MkMessage {
    let data = message.data();
    MkMessage {
        struct_size: size_of::<MkMessage>() as u32,
        topic: message.topic,
        sender: message.sender.handle(),
        sequence: message.sequence,
        priority: message.metadata.priority as u32,
        flags: message.metadata.flags,
        data: data.as_ptr(),
        len: data.len(),
    }
}

unsafe fn metadata(meta: *const MkMessageMeta) -> KernelResult<Option<MessageMetadata>> {
    if meta.is_null() {
        return Ok(None);
    }
    let meta = unsafe { read_record(meta, "message metadata") }?;
    let priority = Priority::from_u32(meta.priority).ok_or_else(|| {
        KernelError::InvalidArgument(format!("unknown priority {}", meta.priority))
    })?;
    Ok(Some(MessageMetadata {
        priority,
        flags: meta.flags,
    }))
}

unsafe fn write_out<T>(out: *mut T, value: T, what: &str) -> KernelResult<()> {
    if out.is_null() {
        return Err(KernelError::InvalidArgument(format!("{what} is null")));
    }
    unsafe { *out = value };
    Ok(())
}

unsafe fn future_ref<'a>(future: *const MkFuture) -> KernelResult<&'a RpcFuture> {
    if future.is_null() {
        return Err(KernelError::InvalidArgument("future is null".to_string()));
    }
    Ok(unsafe { &(*future).inner })
}

/// # Safety
/// `name` must be a NUL-terminated string; `out_topic` must be writable.
pub unsafe extern "C" fn imc_get_topic_id(name: *const c_char, out_topic: *mut u32) -> MkResult {
    guard("imc.get_topic_id", || {
        let name = unsafe { required_str(name, "topic name") }?;
        let topic = state::kernel()?.bus().get_topic_id(name)?;
        unsafe { write_out(out_topic, topic, "out_topic") }?;
        Ok(CODE_OK)
    })
}

/// # Safety
/// `name` must be a NUL-terminated string; `out_rpc` must be writable.
pub unsafe extern "C" fn imc_get_rpc_id(name: *const c_char, out_rpc: *mut u32) -> MkResult {
    guard("imc.get_rpc_id", || {
        let name = unsafe { required_str(name, "rpc name") }?;
        let rpc = state::kernel()?.bus().get_rpc_id(name)?;
        unsafe { write_out(out_rpc, rpc, "out_rpc") }?;
        Ok(CODE_OK)
    })
}

/// Copies `data` and publishes it. Returns the number of queues reached.
///
/// # Safety
/// `data` must hold `len` bytes; `meta` is null or a sized record.
pub unsafe extern "C" fn imc_publish(
    module: MkHandle,
    topic: u32,
    data: *const u8,
    len: usize,
    meta: *const MkMessageMeta,
) -> MkResult {
    guard("imc.publish", || {
        let kernel = state::kernel()?;
        let sender = state::module(&kernel, module)?;
        let data = unsafe { byte_slice(data, len, "data") }?;
        let metadata = unsafe { metadata(meta) }?;
        let queued = kernel.bus().publish(&sender, topic, data, metadata)?;
        Ok(queued.min(i32::MAX as usize) as MkResult)
    })
}

struct ForeignBuffer {
    ptr: *const u8,
    len: usize,
}

// SAFETY: the publisher keeps the buffer alive and unmodified until its
// cleanup runs, from whichever thread drops the last message copy.
unsafe impl Send for ForeignBuffer {}
unsafe impl Sync for ForeignBuffer {}

impl AsRef<[u8]> for ForeignBuffer {
    fn as_ref(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Publishes without copying. `cleanup(cleanup_data)` runs once every
/// subscriber is done with the buffer, including when the publish fails.
///
/// # Safety
/// `data` must hold `len` bytes and stay valid until `cleanup` runs.
pub unsafe extern "C" fn imc_publish_buffer(
    module: MkHandle,
    topic: u32,
    data: *const u8,
    len: usize,
    cleanup: Option<MkCleanupFn>,
    cleanup_data: *mut c_void,
    meta: *const MkMessageMeta,
) -> MkResult {
    let cleanup_data = ForeignPtr(cleanup_data);
    guard("imc.publish_buffer", || {
        let cleanup = cleanup.map(|cleanup| {
            Box::new(move || cleanup(cleanup_data.get())) as modkernel_core::imc::BufferCleanup
        });
        if data.is_null() && len > 0 {
            if let Some(cleanup) = cleanup {
                cleanup();
            }
            return Err(KernelError::InvalidArgument("data is null".to_string()));
        }
        let buffer = ForeignBuffer { ptr: data, len };
        let kernel = state::kernel();
        let prepared = kernel.and_then(|kernel| {
            let sender = state::module(&kernel, module)?;
            let metadata = unsafe { metadata(meta) }?;
            Ok((kernel, sender, metadata))
        });
        let (kernel, sender, metadata) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                if let Some(cleanup) = cleanup {
                    cleanup();
                }
                return Err(err);
            }
        };
        let queued = kernel
            .bus()
            .publish_buffer(&sender, topic, buffer, cleanup, metadata)?;
        Ok(queued.min(i32::MAX as usize) as MkResult)
    })
}

fn c_handler(handler: MkMessageHandlerFn, user_data: ForeignPtr) -> impl Fn(&Message) + Send + Sync {
    move |message| {
        let message = as_c_message(message);
        handler(&message, user_data.get());
    }
}

/// # Safety
/// `out_subscription` must be writable.
pub unsafe extern "C" fn imc_subscribe(
    module: MkHandle,
    topic: u32,
    handler: Option<MkMessageHandlerFn>,
    user_data: *mut c_void,
    out_subscription: *mut u64,
) -> MkResult {
    let user_data = ForeignPtr(user_data);
    guard("imc.subscribe", || {
        let handler = handler.ok_or_else(|| KernelError::InvalidArgument("handler is null".to_string()))?;
        let kernel = state::kernel()?;
        let owner = state::module(&kernel, module)?;
        let id = kernel
            .bus()
            .subscribe(&owner, topic, c_handler(handler, user_data))?;
        unsafe { write_out(out_subscription, id, "out_subscription") }?;
        Ok(CODE_OK)
    })
}

fn subscribe_options(raw: &MkSubscribeOptions, user_data: ForeignPtr) -> KernelResult<SubscribeOptions> {
    let policy = BackpressurePolicy::from_u32(raw.policy)
        .ok_or_else(|| KernelError::InvalidArgument(format!("unknown policy {}", raw.policy)))?;
    let min_priority = Priority::from_u32(raw.min_priority).ok_or_else(|| {
        KernelError::InvalidArgument(format!("unknown priority {}", raw.min_priority))
    })?;
    let mut options = SubscribeOptions::new()
        .with_policy(policy)
        .with_min_priority(min_priority);
    if raw.capacity > 0 {
        options = options.with_capacity(raw.capacity as usize);
    }
    if raw.block_timeout_ms > 0 {
        options = options.with_block_timeout(Duration::from_millis(u64::from(raw.block_timeout_ms)));
    }
    if let Some(filter) = raw.filter {
        options = options.with_filter(c_filter(filter, user_data));
    }
    Ok(options)
}

fn c_filter(filter: MkMessageFilterFn, user_data: ForeignPtr) -> impl Fn(&Message) -> bool + Send + Sync {
    move |message| {
        let message = as_c_message(message);
        filter(&message, user_data.get()) != 0
    }
}

/// # Safety
/// `options` must follow the sized record contract; `out_subscription` must
/// be writable.
pub unsafe extern "C" fn imc_subscribe_ex(
    module: MkHandle,
    topic: u32,
    handler: Option<MkMessageHandlerFn>,
    user_data: *mut c_void,
    options: *const MkSubscribeOptions,
    out_subscription: *mut u64,
) -> MkResult {
    let user_data = ForeignPtr(user_data);
    guard("imc.subscribe_ex", || {
        let handler = handler.ok_or_else(|| KernelError::InvalidArgument("handler is null".to_string()))?;
        let raw = unsafe { read_record(options, "subscribe options") }?;
        let options = subscribe_options(&raw, user_data)?;
        let kernel = state::kernel()?;
        let owner = state::module(&kernel, module)?;
        let id = kernel
            .bus()
            .subscribe_ex(&owner, topic, c_handler(handler, user_data), options)?;
        unsafe { write_out(out_subscription, id, "out_subscription") }?;
        Ok(CODE_OK)
    })
}

pub extern "C" fn imc_unsubscribe(subscription: u64) -> MkResult {
    guard("imc.unsubscribe", || {
        state::kernel()?.bus().unsubscribe(subscription)?;
        Ok(CODE_OK)
    })
}

/// Returns the number of handler invocations (`0` = drain what is queued).
pub extern "C" fn imc_pump(max_per_subscription: u32) -> MkResult {
    guard("imc.pump", || {
        let delivered = state::kernel()?.bus().pump(max_per_subscription as usize);
        Ok(delivered.min(i32::MAX as usize) as MkResult)
    })
}

/// A handler returning a negative code fails the future with that code.
pub extern "C" fn imc_register_rpc(
    module: MkHandle,
    rpc: u32,
    handler: Option<MkRpcHandlerFn>,
    user_data: *mut c_void,
) -> MkResult {
    let user_data = ForeignPtr(user_data);
    guard("imc.register_rpc", || {
        let handler = handler.ok_or_else(|| KernelError::InvalidArgument("handler is null".to_string()))?;
        let kernel = state::kernel()?;
        let owner = state::module(&kernel, module)?;
        kernel.bus().register_rpc(&owner, rpc, move |request: &RpcRequest| {
            let c_request = MkRpcRequest {
                struct_size: size_of::<MkRpcRequest>() as u32,
                rpc: request.rpc,
                caller: request.caller.handle(),
                data: request.payload.as_ptr(),
                len: request.payload.len(),
            };
            let mut response = MkRpcResponse { bytes: Vec::new() };
            let code = handler(&c_request, &mut response, user_data.get());
            if code < 0 {
                return Err(KernelError::FutureFailed {
                    code,
                    message: format!("rpc {} handler returned {code}", request.rpc),
                });
            }
            Ok(response.bytes)
        })?;
        Ok(CODE_OK)
    })
}

pub extern "C" fn imc_unregister_rpc(module: MkHandle, rpc: u32) -> MkResult {
    guard("imc.unregister_rpc", || {
        let kernel = state::kernel()?;
        let caller = state::module(&kernel, module)?;
        kernel.bus().unregister_rpc(&caller, rpc)?;
        Ok(CODE_OK)
    })
}

/// # Safety
/// `data` must hold `len` bytes; `out_future` must be writable.
pub unsafe extern "C" fn imc_call_rpc(
    module: MkHandle,
    rpc: u32,
    data: *const u8,
    len: usize,
    flags: u32,
    out_future: *mut *mut MkFuture,
) -> MkResult {
    guard("imc.call_rpc", || {
        if out_future.is_null() {
            return Err(KernelError::InvalidArgument("out_future is null".to_string()));
        }
        let kernel = state::kernel()?;
        let caller = state::module(&kernel, module)?;
        let data = unsafe { byte_slice(data, len, "data") }?;
        let options = CallOptions {
            deferred: flags & MK_CALL_DEFERRED != 0,
        };
        let future = kernel.bus().call_rpc(&caller, rpc, data, options)?;
        unsafe { *out_future = Box::into_raw(Box::new(MkFuture { inner: future })) };
        Ok(CODE_OK)
    })
}

/// Replaces the response bytes. Only valid inside the RPC handler.
///
/// # Safety
/// `response` must be the pointer passed to the running handler; `data` must
/// hold `len` bytes.
pub unsafe extern "C" fn imc_response_set(response: *mut MkRpcResponse, data: *const u8, len: usize) -> MkResult {
    guard("imc.response_set", || {
        if response.is_null() {
            return Err(KernelError::InvalidArgument("response is null".to_string()));
        }
        let data = unsafe { byte_slice(data, len, "data") }?;
        unsafe { (*response).bytes = data.to_vec() };
        Ok(CODE_OK)
    })
}

/// Waits up to `timeout_ms` (`0` = unbounded). Returns the `FutureState`.
///
/// # Safety
/// `future` must come from `call_rpc` and not be released.
pub unsafe extern "C" fn imc_future_await(future: *const MkFuture, timeout_ms: u32) -> MkResult {
    guard("imc.future_await", || {
        let future = unsafe { future_ref(future) }?;
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(u64::from(timeout_ms)));
        Ok(future.wait(timeout) as MkResult)
    })
}

/// # Safety
/// `future` must come from `call_rpc` and not be released.
pub unsafe extern "C" fn imc_future_get_state(future: *const MkFuture) -> MkResult {
    guard("imc.future_get_state", || {
        Ok(unsafe { future_ref(future) }?.state() as MkResult)
    })
}

/// Copies the response of a ready future. The terminal error of any other
/// state is returned as the result code.
///
/// # Safety
/// `future` must come from `call_rpc` and not be released; `buffer` must hold
/// `capacity` writable bytes.
pub unsafe extern "C" fn imc_future_get_result(
    future: *const MkFuture,
    buffer: *mut u8,
    capacity: usize,
    out_len: *mut usize,
) -> MkResult {
    guard("imc.future_get_result", || {
        let response = unsafe { future_ref(future) }?.result()?;
        unsafe { copy_out(&response, buffer, capacity, out_len) }?;
        Ok(CODE_OK)
    })
}

/// Returns 1 when the future moved to `Cancelled`, 0 if it was terminal.
///
/// # Safety
/// `future` must come from `call_rpc` and not be released.
pub unsafe extern "C" fn imc_future_cancel(future: *const MkFuture) -> MkResult {
    guard("imc.future_cancel", || {
        Ok(unsafe { future_ref(future) }?.cancel() as MkResult)
    })
}

/// # Safety
/// `future` must come from `call_rpc` and not be released.
pub unsafe extern "C" fn imc_future_on_complete(
    future: *const MkFuture,
    callback: Option<MkCompletionFn>,
    user_data: *mut c_void,
) -> MkResult {
    let user_data = ForeignPtr(user_data);
    guard("imc.future_on_complete", || {
        let callback = callback.ok_or_else(|| KernelError::InvalidArgument("callback is null".to_string()))?;
        let future = unsafe { future_ref(future) }?;
        future.on_complete(move |outcome: FutureState| callback(outcome as u32, user_data.get()));
        Ok(CODE_OK)
    })
}

/// Releases the caller's ownership. Null is ignored.
///
/// # Safety
/// `future` must come from `call_rpc` and must not be used afterwards.
pub unsafe extern "C" fn imc_future_release(future: *mut MkFuture) {
    if future.is_null() {
        return;
    }
    guard("imc.future_release", || {
        drop(unsafe { Box::from_raw(future) });
        Ok(CODE_OK)
    });
}

/// # Safety
/// `out_stats` must point to a record whose `struct_size` the caller set.
pub unsafe extern "C" fn imc_get_stats(out_stats: *mut MkImcStats) -> MkResult {
    guard("imc.get_stats", || {
        let stats = MkImcStats::from(state::kernel()?.bus().stats());
        unsafe { write_record(out_stats, &stats, MK_IMC_STATS_MIN_SIZE, "out_stats") }?;
        Ok(CODE_OK)
    })
}

pub extern "C" fn imc_reset_stats() -> MkResult {
    guard("imc.reset_stats", || {
        state::kernel()?.bus().reset_stats();
        Ok(CODE_OK)
    })
}
