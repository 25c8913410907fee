//! Generation-counted slot table with exactly-once finalization.
//!
//! # Responsibility
//! - Register resource types and issue `(type, generation, slot)` handles.
//! - Track one atomic reference count per slot.
//! - Run the type finalizer exactly once when a count drops to zero.
//!
//! # Invariants
//! - A handle is valid iff the slot generation matches and the count is > 0.
//! - The count transition to zero and the generation bump happen inside one
//!   per-slot critical section, so only one releaser observes it.
//! - Finalizers run after that critical section and before the slot returns
//!   to the free list; no registry lock is held while they run.
//! - Generation `0` is never issued, so the null handle never validates.

use super::handle::{Handle, ResourceTypeId};
use crate::error::{KernelError, KernelResult};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Opaque data attached to a handle or a type. The registry never inspects it.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Finalizer invoked once per handle when its count reaches zero.
pub type Finalizer = Arc<dyn Fn(&FinalizedResource) + Send + Sync>;

/// Arguments passed to a type finalizer.
pub struct FinalizedResource {
    /// The handle that just became invalid.
    pub handle: Handle,
    /// User data attached to the handle at the time of the final release.
    pub user_data: Option<UserData>,
    /// Context registered with the type descriptor.
    pub context: Option<UserData>,
}

/// Resource type registration record.
#[derive(Clone)]
pub struct ResourceTypeDescriptor {
    pub name: String,
    pub finalizer: Option<Finalizer>,
    pub context: Option<UserData>,
    /// Mod that registered the type; its types retire when it detaches.
    pub owner: Option<Handle>,
}

impl ResourceTypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            finalizer: None,
            context: None,
            owner: None,
        }
    }

    pub fn with_finalizer(
        mut self,
        finalizer: impl Fn(&FinalizedResource) + Send + Sync + 'static,
    ) -> Self {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn with_context(mut self, context: UserData) -> Self {
        self.context = Some(context);
        self
    }

    pub fn owned_by(mut self, owner: Handle) -> Self {
        self.owner = Some(owner);
        self
    }

    fn validate(&self) -> KernelResult<()> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(KernelError::InvalidArgument(
                "resource type name must not be empty".to_string(),
            ));
        }
        if name.trim() != name || name.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(KernelError::InvalidArgument(format!(
                "resource type name contains whitespace or control characters: {name:?}"
            )));
        }
        Ok(())
    }
}

struct TypeEntry {
    id: ResourceTypeId,
    descriptor: ResourceTypeDescriptor,
    retired: AtomicBool,
}

#[derive(Default)]
struct SlotState {
    generation: u32,
    type_id: ResourceTypeId,
    user_data: Option<UserData>,
    type_entry: Option<Arc<TypeEntry>>,
}

#[derive(Default)]
struct Slot {
    refcount: AtomicU32,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct RegistryInner {
    types: RwLock<Vec<Arc<TypeEntry>>>,
    slots: RwLock<Vec<Arc<Slot>>>,
    free: Mutex<Vec<u32>>,
    live: AtomicUsize,
}

/// Thread-safe resource handle registry. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    inner: Arc<RegistryInner>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource type and returns its runtime id.
    ///
    /// # Errors
    /// - `InvalidArgument` when the descriptor name is empty or malformed.
    /// - `AlreadyExists` when an active type already uses the name.
    pub fn register_type(&self, descriptor: ResourceTypeDescriptor) -> KernelResult<ResourceTypeId> {
        descriptor.validate()?;
        let mut types = self.inner.types.write();
        if types
            .iter()
            .any(|entry| !entry.retired.load(Ordering::Acquire) && entry.descriptor.name == descriptor.name)
        {
            return Err(KernelError::AlreadyExists(format!(
                "resource type `{}`",
                descriptor.name
            )));
        }

        let id = u32::try_from(types.len() + 1)
            .map_err(|_| KernelError::Internal("resource type table exhausted".to_string()))?;
        info!(
            "event=type_register module=resource status=ok type_id={} name={} finalizer={}",
            id,
            descriptor.name,
            descriptor.finalizer.is_some()
        );
        types.push(Arc::new(TypeEntry {
            id,
            descriptor,
            retired: AtomicBool::new(false),
        }));
        Ok(id)
    }

    /// Retires a type: new handles can no longer be created for it.
    ///
    /// Live handles keep the retired descriptor and still finalize normally.
    pub fn unregister_type(&self, type_id: ResourceTypeId) -> KernelResult<()> {
        let entry = self.type_entry(type_id)?;
        entry.retired.store(true, Ordering::Release);
        info!(
            "event=type_unregister module=resource status=ok type_id={} name={}",
            type_id, entry.descriptor.name
        );
        Ok(())
    }

    /// Retires every active type registered by `owner`. Returns the count.
    pub fn retire_types_owned_by(&self, owner: Handle) -> usize {
        let types = self.inner.types.read();
        let mut retired = 0;
        for entry in types.iter() {
            if entry.descriptor.owner == Some(owner) && !entry.retired.swap(true, Ordering::AcqRel) {
                retired += 1;
            }
        }
        retired
    }

    /// Returns the registered name of a type, retired or not.
    pub fn type_name(&self, type_id: ResourceTypeId) -> Option<String> {
        self.lookup_type(type_id)
            .map(|entry| entry.descriptor.name.clone())
    }

    /// Creates a handle of `type_id` with reference count 1.
    pub fn create(&self, type_id: ResourceTypeId) -> KernelResult<Handle> {
        let entry = self.type_entry(type_id)?;
        if entry.retired.load(Ordering::Acquire) {
            return Err(KernelError::NotFound(format!(
                "resource type {type_id} has been unregistered"
            )));
        }

        let (index, slot) = self.acquire_slot()?;
        let mut state = slot.state.lock();
        state.generation = next_generation(state.generation);
        state.type_id = entry.id;
        state.user_data = None;
        state.type_entry = Some(entry);
        slot.refcount.store(1, Ordering::Release);
        let handle = Handle {
            type_id,
            generation: state.generation,
            slot: index,
        };
        drop(state);

        self.inner.live.fetch_add(1, Ordering::AcqRel);
        debug!(
            "event=handle_create module=resource status=ok handle={}",
            handle
        );
        Ok(handle)
    }

    /// Increments the reference count of a live handle.
    pub fn retain(&self, handle: Handle) -> KernelResult<u32> {
        let slot = self.slot(handle)?;
        let state = slot.state.lock();
        check_live(&slot, &state, handle)?;
        let previous = slot.refcount.load(Ordering::Acquire);
        if previous == u32::MAX {
            return Err(KernelError::Internal(format!(
                "reference count overflow on handle {handle}"
            )));
        }
        slot.refcount.store(previous + 1, Ordering::Release);
        Ok(previous + 1)
    }

    /// Decrements the reference count and finalizes at zero.
    ///
    /// Returns the remaining count. The finalizer runs on this thread before
    /// the call returns when the count reaches zero.
    pub fn release(&self, handle: Handle) -> KernelResult<u32> {
        let slot = self.slot(handle)?;
        let mut state = slot.state.lock();
        check_live(&slot, &state, handle)?;

        let previous = slot.refcount.fetch_sub(1, Ordering::AcqRel);
        if previous > 1 {
            return Ok(previous - 1);
        }
        if previous == 0 {
            slot.refcount.store(0, Ordering::Release);
            error!(
                "event=handle_release module=resource status=error handle={} error_code=refcount_underflow",
                handle
            );
            return Err(KernelError::Internal(format!(
                "reference count underflow on handle {handle}"
            )));
        }

        state.generation = next_generation(state.generation);
        let user_data = state.user_data.take();
        let entry = state.type_entry.take();
        drop(state);

        if let Some(entry) = entry {
            run_finalizer(&entry, handle, user_data);
        }

        self.inner.live.fetch_sub(1, Ordering::AcqRel);
        self.inner.free.lock().push(handle.slot);
        debug!(
            "event=handle_finalize module=resource status=ok handle={}",
            handle
        );
        Ok(0)
    }

    /// Returns whether `handle` currently names a live resource.
    pub fn validate(&self, handle: Handle) -> bool {
        let Ok(slot) = self.slot(handle) else {
            return false;
        };
        let state = slot.state.lock();
        check_live(&slot, &state, handle).is_ok()
    }

    /// Checks that `handle` is live and was issued for type `expected`.
    pub fn check_type(&self, handle: Handle, expected: ResourceTypeId) -> KernelResult<()> {
        if !handle.is_null() && handle.type_id != expected {
            return Err(KernelError::HandleTypeMismatch { handle, expected });
        }
        let slot = self.slot(handle)?;
        let state = slot.state.lock();
        check_live(&slot, &state, handle)
    }

    /// Returns the current reference count of a live handle.
    pub fn refcount(&self, handle: Handle) -> KernelResult<u32> {
        let slot = self.slot(handle)?;
        let state = slot.state.lock();
        check_live(&slot, &state, handle)?;
        Ok(slot.refcount.load(Ordering::Acquire))
    }

    /// Attaches user data to a handle, replacing any previous value.
    pub fn attach_user_data(&self, handle: Handle, data: Option<UserData>) -> KernelResult<()> {
        let slot = self.slot(handle)?;
        let mut state = slot.state.lock();
        check_live(&slot, &state, handle)?;
        state.user_data = data;
        Ok(())
    }

    /// Returns the user data currently attached to a handle.
    pub fn user_data(&self, handle: Handle) -> KernelResult<Option<UserData>> {
        let slot = self.slot(handle)?;
        let state = slot.state.lock();
        check_live(&slot, &state, handle)?;
        Ok(state.user_data.clone())
    }

    /// Returns the user data attached to a handle, downcast to `T`.
    pub fn user_data_as<T: Any + Send + Sync>(&self, handle: Handle) -> KernelResult<Option<Arc<T>>> {
        Ok(self
            .user_data(handle)?
            .and_then(|data| data.downcast::<T>().ok()))
    }

    /// Number of live handles across all types.
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    fn lookup_type(&self, type_id: ResourceTypeId) -> Option<Arc<TypeEntry>> {
        let index = usize::try_from(type_id).ok()?.checked_sub(1)?;
        self.inner.types.read().get(index).cloned()
    }

    fn type_entry(&self, type_id: ResourceTypeId) -> KernelResult<Arc<TypeEntry>> {
        self.lookup_type(type_id)
            .ok_or_else(|| KernelError::NotFound(format!("resource type {type_id}")))
    }

    fn slot(&self, handle: Handle) -> KernelResult<Arc<Slot>> {
        if handle.is_null() {
            return Err(KernelError::InvalidHandle(handle));
        }
        let slots = self.inner.slots.read();
        slots
            .get(handle.slot as usize)
            .cloned()
            .ok_or(KernelError::InvalidHandle(handle))
    }

    fn acquire_slot(&self) -> KernelResult<(u32, Arc<Slot>)> {
        if let Some(index) = self.inner.free.lock().pop() {
            let slots = self.inner.slots.read();
            return slots
                .get(index as usize)
                .cloned()
                .map(|slot| (index, slot))
                .ok_or_else(|| {
                    KernelError::Internal(format!("free list names missing slot {index}"))
                });
        }

        let mut slots = self.inner.slots.write();
        let index = u32::try_from(slots.len())
            .map_err(|_| KernelError::Internal("resource slot table exhausted".to_string()))?;
        let slot = Arc::new(Slot::default());
        slots.push(Arc::clone(&slot));
        Ok((index, slot))
    }
}

fn check_live(slot: &Slot, state: &SlotState, handle: Handle) -> KernelResult<()> {
    if state.generation != handle.generation
        || state.type_id != handle.type_id
        || slot.refcount.load(Ordering::Acquire) == 0
    {
        return Err(KernelError::InvalidHandle(handle));
    }
    Ok(())
}

fn next_generation(current: u32) -> u32 {
    current.wrapping_add(1).max(1)
}

fn run_finalizer(entry: &TypeEntry, handle: Handle, user_data: Option<UserData>) {
    let Some(finalizer) = entry.descriptor.finalizer.as_ref() else {
        return;
    };
    let finalized = FinalizedResource {
        handle,
        user_data,
        context: entry.descriptor.context.clone(),
    };
    if catch_unwind(AssertUnwindSafe(|| finalizer(&finalized))).is_err() {
        warn!(
            "event=handle_finalize module=resource status=error handle={} type={} error_code=finalizer_panicked",
            handle, entry.descriptor.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{ResourceRegistry, ResourceTypeDescriptor};
    use crate::error::KernelError;
    use crate::resource::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn rejects_malformed_descriptor() {
        let registry = ResourceRegistry::new();
        let err = registry
            .register_type(ResourceTypeDescriptor::new("  "))
            .expect_err("empty name must fail");
        assert!(matches!(err, KernelError::InvalidArgument(_)));

        let err = registry
            .register_type(ResourceTypeDescriptor::new("bad name"))
            .expect_err("whitespace must fail");
        assert!(matches!(err, KernelError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_duplicate_active_type_name() {
        let registry = ResourceRegistry::new();
        let first = registry
            .register_type(ResourceTypeDescriptor::new("texture"))
            .expect("first registration");
        let err = registry
            .register_type(ResourceTypeDescriptor::new("texture"))
            .expect_err("duplicate must fail");
        assert!(matches!(err, KernelError::AlreadyExists(_)));

        registry.unregister_type(first).expect("unregister");
        registry
            .register_type(ResourceTypeDescriptor::new("texture"))
            .expect("retired name can be reused");
    }

    #[test]
    fn null_and_out_of_range_handles_are_invalid() {
        let registry = ResourceRegistry::new();
        assert!(!registry.validate(Handle::NULL));
        let bogus = Handle {
            type_id: 1,
            generation: 1,
            slot: 99,
        };
        assert!(!registry.validate(bogus));
        assert!(matches!(
            registry.release(bogus),
            Err(KernelError::InvalidHandle(_))
        ));
    }

    #[test]
    fn retain_release_tracks_counts_and_finalizes_once() {
        let registry = ResourceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let type_id = registry
            .register_type(
                ResourceTypeDescriptor::new("buffer").with_finalizer(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("register type");

        let handle = registry.create(type_id).expect("create");
        assert_eq!(registry.retain(handle).expect("retain"), 2);
        assert_eq!(registry.release(handle).expect("release"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.release(handle).expect("final release"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!registry.validate(handle));
        assert!(registry.release(handle).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn user_data_is_last_write_wins_and_reaches_finalizer() {
        let registry = ResourceRegistry::new();
        let observed = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&observed);
        let type_id = registry
            .register_type(ResourceTypeDescriptor::new("sound").with_finalizer(move |res| {
                let value = res
                    .user_data
                    .as_ref()
                    .and_then(|data| data.downcast_ref::<usize>())
                    .copied()
                    .unwrap_or(0);
                sink.store(value, Ordering::SeqCst);
            }))
            .expect("register type");
        let handle = registry.create(type_id).expect("create");

        registry
            .attach_user_data(handle, Some(Arc::new(1usize)))
            .expect("attach first");
        registry
            .attach_user_data(handle, Some(Arc::new(7usize)))
            .expect("attach second");
        let current = registry
            .user_data_as::<usize>(handle)
            .expect("lookup")
            .expect("data present");
        assert_eq!(*current, 7);

        registry.release(handle).expect("release");
        assert_eq!(observed.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn retired_type_refuses_create_but_finalizes_live_handles() {
        let registry = ResourceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let type_id = registry
            .register_type(ResourceTypeDescriptor::new("mesh").with_finalizer(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("register");
        let handle = registry.create(type_id).expect("create");
        registry.unregister_type(type_id).expect("unregister");

        assert!(matches!(
            registry.create(type_id),
            Err(KernelError::NotFound(_))
        ));
        registry.release(handle).expect("release");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finalizer_panic_does_not_poison_slot() {
        let registry = ResourceRegistry::new();
        let type_id = registry
            .register_type(
                ResourceTypeDescriptor::new("fragile").with_finalizer(|_| panic!("finalizer boom")),
            )
            .expect("register");
        let handle = registry.create(type_id).expect("create");
        registry.release(handle).expect("release survives panic");

        let reused = registry.create(type_id).expect("slot reusable");
        assert_eq!(reused.slot, handle.slot);
        assert!(registry.validate(reused));
    }
}
