//! Kernel-wide error type and stable result codes.
//!
//! # Responsibility
//! - Define the one error type every fallible core API returns.
//! - Map each failure kind onto a stable negative `i32` code grouped by
//!   subsystem range, so the C boundary can forward it unchanged.
//!
//! # Invariants
//! - Success is `0` or a non-negative count; every error code is negative.
//! - Codes never change once published; new kinds take unused codes inside
//!   their subsystem range.

use crate::resource::Handle;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub type KernelResult<T> = Result<T, KernelError>;

/// Signed result code shared with C callers.
pub type ResultCode = i32;

pub const CODE_OK: ResultCode = 0;

pub const CODE_INVALID_ARGUMENT: ResultCode = -1;
pub const CODE_NOT_FOUND: ResultCode = -2;
pub const CODE_ALREADY_EXISTS: ResultCode = -3;
pub const CODE_INTERNAL: ResultCode = -4;
pub const CODE_SHUTTING_DOWN: ResultCode = -5;

pub const CODE_TYPE_MISMATCH: ResultCode = -100;
pub const CODE_IO: ResultCode = -101;
pub const CODE_PARSE: ResultCode = -102;
pub const CODE_MIGRATION_CHAIN_BROKEN: ResultCode = -103;
pub const CODE_UNSUPPORTED_SCHEMA_VERSION: ResultCode = -104;
pub const CODE_MIGRATION_FAILED: ResultCode = -105;

pub const CODE_QUEUE_FULL: ResultCode = -200;
pub const CODE_WOULD_BLOCK: ResultCode = -201;
pub const CODE_TIMEOUT: ResultCode = -202;
pub const CODE_FUTURE_CANCELLED: ResultCode = -203;
pub const CODE_FUTURE_FAILED: ResultCode = -204;

pub const CODE_INVALID_HANDLE: ResultCode = -300;
pub const CODE_HANDLE_TYPE_MISMATCH: ResultCode = -301;

pub const CODE_DEADLOCK_DETECTED: ResultCode = -400;
pub const CODE_NOT_OWNER: ResultCode = -401;

/// Error returned by every fallible kernel operation.
#[derive(Debug)]
pub enum KernelError {
    InvalidArgument(String),
    NotFound(String),
    AlreadyExists(String),
    Internal(String),
    ShuttingDown,
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        message: String,
    },
    MigrationChainBroken {
        module: String,
        from_version: u32,
        target_version: u32,
    },
    UnsupportedSchemaVersion {
        module: String,
        stored_version: u32,
        latest_supported: u32,
    },
    MigrationFailed {
        module: String,
        from_version: u32,
        to_version: u32,
        message: String,
    },
    QueueFull {
        subscription: u64,
    },
    WouldBlock(String),
    Timeout(String),
    FutureCancelled,
    FutureFailed {
        code: ResultCode,
        message: String,
    },
    InvalidHandle(Handle),
    HandleTypeMismatch {
        handle: Handle,
        expected: u32,
    },
    DeadlockDetected(String),
    NotOwner(String),
}

impl KernelError {
    /// Stable negative result code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::InvalidArgument(_) => CODE_INVALID_ARGUMENT,
            Self::NotFound(_) => CODE_NOT_FOUND,
            Self::AlreadyExists(_) => CODE_ALREADY_EXISTS,
            Self::Internal(_) => CODE_INTERNAL,
            Self::ShuttingDown => CODE_SHUTTING_DOWN,
            Self::TypeMismatch { .. } => CODE_TYPE_MISMATCH,
            Self::Io { .. } => CODE_IO,
            Self::Parse { .. } => CODE_PARSE,
            Self::MigrationChainBroken { .. } => CODE_MIGRATION_CHAIN_BROKEN,
            Self::UnsupportedSchemaVersion { .. } => CODE_UNSUPPORTED_SCHEMA_VERSION,
            Self::MigrationFailed { .. } => CODE_MIGRATION_FAILED,
            Self::QueueFull { .. } => CODE_QUEUE_FULL,
            Self::WouldBlock(_) => CODE_WOULD_BLOCK,
            Self::Timeout(_) => CODE_TIMEOUT,
            Self::FutureCancelled => CODE_FUTURE_CANCELLED,
            Self::FutureFailed { .. } => CODE_FUTURE_FAILED,
            Self::InvalidHandle(_) => CODE_INVALID_HANDLE,
            Self::HandleTypeMismatch { .. } => CODE_HANDLE_TYPE_MISMATCH,
            Self::DeadlockDetected(_) => CODE_DEADLOCK_DETECTED,
            Self::NotOwner(_) => CODE_NOT_OWNER,
        }
    }

    /// Short machine-friendly label used in log events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::Internal(_) => "internal",
            Self::ShuttingDown => "shutting_down",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Io { .. } => "io",
            Self::Parse { .. } => "parse",
            Self::MigrationChainBroken { .. } => "migration_chain_broken",
            Self::UnsupportedSchemaVersion { .. } => "unsupported_schema_version",
            Self::MigrationFailed { .. } => "migration_failed",
            Self::QueueFull { .. } => "queue_full",
            Self::WouldBlock(_) => "would_block",
            Self::Timeout(_) => "timeout",
            Self::FutureCancelled => "future_cancelled",
            Self::FutureFailed { .. } => "future_failed",
            Self::InvalidHandle(_) => "invalid_handle",
            Self::HandleTypeMismatch { .. } => "handle_type_mismatch",
            Self::DeadlockDetected(_) => "deadlock_detected",
            Self::NotOwner(_) => "not_owner",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::AlreadyExists(what) => write!(f, "already exists: {what}"),
            Self::Internal(message) => write!(f, "internal error: {message}"),
            Self::ShuttingDown => write!(f, "kernel is shutting down"),
            Self::TypeMismatch {
                key,
                expected,
                actual,
            } => write!(
                f,
                "config entry `{key}` holds a {actual} value, expected {expected}"
            ),
            Self::Io { path, source } => {
                write!(f, "io error at `{}`: {source}", path.display())
            }
            Self::Parse { path, message } => {
                write!(f, "invalid config document `{}`: {message}", path.display())
            }
            Self::MigrationChainBroken {
                module,
                from_version,
                target_version,
            } => write!(
                f,
                "no migration path for `{module}` from schema version {from_version} to {target_version}"
            ),
            Self::UnsupportedSchemaVersion {
                module,
                stored_version,
                latest_supported,
            } => write!(
                f,
                "config document for `{module}` has schema version {stored_version}, newer than supported {latest_supported}"
            ),
            Self::MigrationFailed {
                module,
                from_version,
                to_version,
                message,
            } => write!(
                f,
                "migration {from_version}->{to_version} for `{module}` failed: {message}"
            ),
            Self::QueueFull { subscription } => {
                write!(f, "delivery queue of subscription {subscription} is full")
            }
            Self::WouldBlock(what) => write!(f, "operation would block: {what}"),
            Self::Timeout(what) => write!(f, "timed out: {what}"),
            Self::FutureCancelled => write!(f, "future was cancelled"),
            Self::FutureFailed { code, message } => {
                write!(f, "rpc failed with code {code}: {message}")
            }
            Self::InvalidHandle(handle) => write!(f, "invalid handle {handle}"),
            Self::HandleTypeMismatch { handle, expected } => {
                write!(f, "handle {handle} is not of resource type {expected}")
            }
            Self::DeadlockDetected(what) => write!(f, "deadlock detected: {what}"),
            Self::NotOwner(what) => write!(f, "caller does not own {what}"),
        }
    }
}

impl Error for KernelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
