//! Thread-local last-error slot and the panic guard used by every entry point.
//!
//! # Invariants
//! - Entry points return a `ResultCode`; detail is only reachable through
//!   the `mk_last_error_*` queries on the same thread.
//! - A panic never unwinds into the caller; it is recorded as `Internal`.

use modkernel_core::error::{KernelError, ResultCode, CODE_INTERNAL, CODE_OK};
use modkernel_core::logging::sanitize_message;
use std::cell::RefCell;
use std::ffi::{c_char, CString};
use std::panic::{catch_unwind, AssertUnwindSafe, Location};

const MESSAGE_MAX_CHARS: usize = 512;

pub(crate) struct LastError {
    code: ResultCode,
    pub message: CString,
    pub api: CString,
    pub location: CString,
}

impl Default for LastError {
    fn default() -> Self {
        Self {
            code: CODE_OK,
            message: CString::default(),
            api: CString::default(),
            location: CString::default(),
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<LastError> = RefCell::new(LastError::default());
}

fn c_string(value: &str) -> CString {
    CString::new(value.replace('\0', " ")).unwrap_or_default()
}

/// Records `err` for the calling thread and returns its code.
#[track_caller]
pub(crate) fn record(api: &'static str, err: &KernelError) -> ResultCode {
    let location = Location::caller();
    let code = err.code();
    let message = sanitize_message(&err.to_string(), MESSAGE_MAX_CHARS);
    log::debug!(
        "event=ffi_error module=kernel status=error api={} error_code={} kind={}",
        api,
        code,
        err.label()
    );
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = LastError {
            code,
            message: c_string(&message),
            api: c_string(api),
            location: c_string(&format!("{}:{}", location.file(), location.line())),
        };
    });
    code
}

pub(crate) fn clear() {
    LAST_ERROR.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.code != CODE_OK {
            *slot = LastError::default();
        }
    });
}

/// Runs one entry point body. Success clears the last error; failure and
/// panics record it.
#[track_caller]
pub(crate) fn guard<F>(api: &'static str, body: F) -> ResultCode
where
    F: FnOnce() -> Result<ResultCode, KernelError>,
{
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(code)) => {
            clear();
            code
        }
        Ok(Err(err)) => record(api, &err),
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!(
                "event=ffi_panic module=kernel status=error api={} error_code={}",
                api,
                CODE_INTERNAL
            );
            record(api, &KernelError::Internal(format!("panic in {api}: {detail}")))
        }
    }
}

pub(crate) fn last_code() -> ResultCode {
    LAST_ERROR.with(|slot| slot.borrow().code)
}

/// Pointer into the thread's slot; stays valid until the next entry point
/// call on this thread.
pub(crate) fn last_field(select: fn(&LastError) -> &CString) -> *const c_char {
    LAST_ERROR.with(|slot| select(&slot.borrow()).as_ptr())
}
