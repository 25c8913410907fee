//! Name interning for topic and RPC identifiers.

use crate::error::{KernelError, KernelResult};
use indexmap::IndexSet;
use parking_lot::RwLock;

/// Interned publish/subscribe channel id. `0` is invalid.
pub type TopicId = u32;
/// Interned remote procedure id. `0` is invalid.
pub type RpcId = u32;

/// Insertion-ordered name table; the id of a name is its position + 1.
pub(crate) struct NameTable {
    kind: &'static str,
    names: RwLock<IndexSet<String>>,
}

impl NameTable {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            names: RwLock::new(IndexSet::new()),
        }
    }

    /// Returns the id of `name`, interning it on first use.
    pub fn intern(&self, name: &str) -> KernelResult<u32> {
        if name.is_empty() || name.chars().any(char::is_control) {
            return Err(KernelError::InvalidArgument(format!(
                "{} name must be non-empty printable text: {name:?}",
                self.kind
            )));
        }
        if let Some(index) = self.names.read().get_index_of(name) {
            return to_id(index);
        }
        let (index, _) = self.names.write().insert_full(name.to_string());
        to_id(index)
    }

    /// Returns the id of an already interned name.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        let index = self.names.read().get_index_of(name)?;
        to_id(index).ok()
    }

    pub fn name(&self, id: u32) -> Option<String> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.names.read().get_index(index).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        id != 0 && (id as usize) <= self.names.read().len()
    }

    /// `0` is `InvalidArgument`; a non-zero id never issued is `NotFound`.
    pub fn check(&self, id: u32) -> KernelResult<()> {
        if id == 0 {
            return Err(KernelError::InvalidArgument(format!(
                "{} id 0 is reserved",
                self.kind
            )));
        }
        if self.contains(id) {
            return Ok(());
        }
        Err(KernelError::NotFound(format!("{} id {id}", self.kind)))
    }
}

fn to_id(index: usize) -> KernelResult<u32> {
    u32::try_from(index + 1)
        .map_err(|_| KernelError::Internal("interned name table exhausted".to_string()))
}
