//! Staged write batches.

use super::value::{ConfigKey, ConfigValue};
use crate::context::ModContext;
use crate::error::{KernelError, KernelResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque batch identifier. `0` is never issued.
pub type BatchId = u64;

pub(crate) struct PendingBatch {
    pub owner: ModContext,
    pub writes: Vec<(ConfigKey, ConfigValue)>,
}

/// Open batches keyed by id. Taking a batch out of the table is the single
/// point where commit and discard race, so at most one of them wins.
#[derive(Default)]
pub(crate) struct BatchTable {
    open: Mutex<HashMap<BatchId, PendingBatch>>,
    next_id: AtomicU64,
}

impl BatchTable {
    pub fn begin(&self, owner: &ModContext) -> BatchId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.lock().insert(
            id,
            PendingBatch {
                owner: owner.clone(),
                writes: Vec::new(),
            },
        );
        id
    }

    pub fn stage(
        &self,
        caller: &ModContext,
        id: BatchId,
        key: ConfigKey,
        value: ConfigValue,
    ) -> KernelResult<usize> {
        key.validate()?;
        let mut open = self.open.lock();
        let batch = open.get_mut(&id).ok_or_else(|| missing(id))?;
        check_owner(batch, caller, id)?;
        batch.writes.push((key, value));
        Ok(batch.writes.len())
    }

    /// Removes the batch for commit or discard after an ownership check.
    pub fn take(&self, caller: &ModContext, id: BatchId) -> KernelResult<PendingBatch> {
        let mut open = self.open.lock();
        let batch = open.get(&id).ok_or_else(|| missing(id))?;
        check_owner(batch, caller, id)?;
        open.remove(&id).ok_or_else(|| missing(id))
    }

    pub fn staged_len(&self, id: BatchId) -> Option<usize> {
        self.open.lock().get(&id).map(|batch| batch.writes.len())
    }

    pub fn discard_owned_by(&self, owner: &ModContext) -> usize {
        let mut open = self.open.lock();
        let before = open.len();
        open.retain(|_, batch| batch.owner != *owner);
        before - open.len()
    }
}

fn check_owner(batch: &PendingBatch, caller: &ModContext, id: BatchId) -> KernelResult<()> {
    if batch.owner != *caller {
        return Err(KernelError::NotOwner(format!(
            "config batch {id} (owned by `{}`)",
            batch.owner.name()
        )));
    }
    Ok(())
}

fn missing(id: BatchId) -> KernelError {
    KernelError::NotFound(format!("config batch {id}"))
}

#[cfg(test)]
mod tests {
    use super::BatchTable;
    use crate::config::{ConfigKey, ConfigValue};
    use crate::context::ModContext;
    use crate::error::KernelError;
    use crate::resource::Handle;

    fn ctx(name: &str, slot: u32) -> ModContext {
        ModContext::new(
            Handle {
                type_id: 1,
                generation: 1,
                slot,
            },
            name,
        )
    }

    #[test]
    fn only_owner_can_stage_or_take() {
        let table = BatchTable::default();
        let owner = ctx("alpha", 0);
        let other = ctx("beta", 1);
        let id = table.begin(&owner);

        let err = table
            .stage(&other, id, ConfigKey::new("a", "b"), ConfigValue::Bool(true))
            .expect_err("foreign stage");
        assert!(matches!(err, KernelError::NotOwner(_)));
        assert_eq!(
            table
                .stage(&owner, id, ConfigKey::new("a", "b"), ConfigValue::Bool(true))
                .expect("owner stage"),
            1
        );
        assert!(matches!(
            table.take(&other, id),
            Err(KernelError::NotOwner(_))
        ));

        let batch = table.take(&owner, id).expect("owner take");
        assert_eq!(batch.writes.len(), 1);
        assert!(matches!(
            table.take(&owner, id),
            Err(KernelError::NotFound(_))
        ));
    }

    #[test]
    fn discards_batches_of_one_owner() {
        let table = BatchTable::default();
        let owner = ctx("alpha", 0);
        let other = ctx("beta", 1);
        let first = table.begin(&owner);
        table.begin(&owner);
        let kept = table.begin(&other);
        assert_ne!(first, 0);

        assert_eq!(table.discard_owned_by(&owner), 2);
        assert_eq!(table.staged_len(kept), Some(0));
        assert_eq!(table.staged_len(first), None);
    }
}
