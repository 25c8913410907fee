//! Explicit per-mod call context.
//!
//! Every service operation that acts on behalf of a mod takes a `ModContext`
//! instead of reading a thread-bound "current module".

use crate::resource::Handle;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Identity of one attached mod: its kernel handle plus its stable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModContext {
    handle: Handle,
    name: Arc<str>,
}

impl ModContext {
    pub fn new(handle: Handle, name: impl Into<Arc<str>>) -> Self {
        Self {
            handle,
            name: name.into(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for ModContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.handle)
    }
}
