//! Messages and payload buffers carried by the bus.

use super::intern::TopicId;
use crate::context::ModContext;
use log::error;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Delivery priority. Ordered `Low < Normal < High < Critical`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            3 => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publisher-supplied metadata. Absent metadata means `Normal` with no flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub priority: Priority,
    /// Opaque to the bus; passed through to handlers.
    pub flags: u32,
}

impl MessageMetadata {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            flags: 0,
        }
    }
}

/// Cleanup run exactly once after the last subscriber releases a buffer.
pub type BufferCleanup = Box<dyn FnOnce() + Send + Sync>;

struct PayloadInner {
    bytes: Box<dyn AsRef<[u8]> + Send + Sync>,
    cleanup: Option<BufferCleanup>,
}

impl Drop for PayloadInner {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
            error!("event=buffer_cleanup module=imc status=error reason=panic");
        }
    }
}

/// Shared, immutable message payload.
///
/// Every queued copy of a message points at the same buffer; cleanup (if
/// any) runs when the last copy is dropped.
#[derive(Clone)]
pub struct Payload {
    inner: Arc<PayloadInner>,
}

impl Payload {
    /// Copies `data` into a bus-owned buffer.
    pub fn copy_from(data: &[u8]) -> Self {
        Self::wrap(data.to_vec(), None)
    }

    /// Wraps a caller-owned buffer without copying it.
    pub fn wrap<B>(buffer: B, cleanup: Option<BufferCleanup>) -> Self
    where
        B: AsRef<[u8]> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PayloadInner {
                bytes: Box::new(buffer),
                cleanup,
            }),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        (*self.inner.bytes).as_ref()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload").field("len", &self.len()).finish()
    }
}

/// One delivered message as seen by filters and handlers.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: TopicId,
    pub sender: ModContext,
    /// Bus-wide publish sequence, strictly increasing per bus.
    pub sequence: u64,
    pub metadata: MessageMetadata,
    pub payload: Payload,
}

impl Message {
    pub fn data(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    pub fn priority(&self) -> Priority {
        self.metadata.priority
    }
}
