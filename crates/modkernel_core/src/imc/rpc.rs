//! RPC handler table, inline and deferred call execution.

use super::future::{FutureShared, FutureState, RpcFuture};
use super::intern::RpcId;
use super::stats::BusCounters;
use crate::context::ModContext;
use crate::error::{KernelError, KernelResult};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// One call as seen by a handler.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub rpc: RpcId,
    pub caller: ModContext,
    pub payload: Vec<u8>,
}

/// Handlers return the response bytes or an error; a
/// `KernelError::FutureFailed` keeps its code and message verbatim.
pub type RpcHandler = Arc<dyn Fn(&RpcRequest) -> KernelResult<Vec<u8>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Queue the call for `pump`/`service_rpcs` instead of running it on the
    /// calling thread.
    pub deferred: bool,
}

impl CallOptions {
    pub fn deferred() -> Self {
        Self { deferred: true }
    }
}

struct RpcEntry {
    owner: ModContext,
    handler: RpcHandler,
}

struct DeferredCall {
    request: RpcRequest,
    future: Arc<FutureShared>,
}

thread_local! {
    /// (bus identity, rpc id) of handlers currently executing on this thread.
    static ACTIVE_CALLS: RefCell<Vec<(usize, RpcId)>> = const { RefCell::new(Vec::new()) };
}

struct ActiveCallGuard {
    key: (usize, RpcId),
}

impl ActiveCallGuard {
    fn enter(key: (usize, RpcId)) -> Option<Self> {
        ACTIVE_CALLS.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&key) {
                return None;
            }
            active.push(key);
            Some(Self { key })
        })
    }
}

impl Drop for ActiveCallGuard {
    fn drop(&mut self) {
        ACTIVE_CALLS.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(position) = active.iter().rposition(|key| *key == self.key) {
                active.remove(position);
            }
        });
    }
}

#[derive(Default)]
pub(crate) struct RpcTable {
    handlers: RwLock<HashMap<RpcId, Arc<RpcEntry>>>,
    deferred: Mutex<VecDeque<DeferredCall>>,
    pending: Mutex<Vec<Weak<FutureShared>>>,
}

impl RpcTable {
    pub fn register(&self, owner: &ModContext, rpc: RpcId, handler: RpcHandler) -> KernelResult<()> {
        let mut handlers = self.handlers.write();
        if let Some(existing) = handlers.get(&rpc) {
            return Err(KernelError::AlreadyExists(format!(
                "rpc {rpc} handler (owned by `{}`)",
                existing.owner.name()
            )));
        }
        handlers.insert(
            rpc,
            Arc::new(RpcEntry {
                owner: owner.clone(),
                handler,
            }),
        );
        info!(
            "event=rpc_register module=rpc status=ok rpc_id={} owner={}",
            rpc,
            owner.name()
        );
        Ok(())
    }

    pub fn unregister(&self, caller: &ModContext, rpc: RpcId) -> KernelResult<()> {
        let mut handlers = self.handlers.write();
        let entry = handlers
            .get(&rpc)
            .ok_or_else(|| KernelError::NotFound(format!("rpc {rpc} handler")))?;
        if entry.owner != *caller {
            return Err(KernelError::NotOwner(format!(
                "rpc {rpc} handler (owned by `{}`)",
                entry.owner.name()
            )));
        }
        handlers.remove(&rpc);
        info!(
            "event=rpc_unregister module=rpc status=ok rpc_id={} owner={}",
            rpc,
            caller.name()
        );
        Ok(())
    }

    pub fn unregister_owned_by(&self, owner: &ModContext) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|_, entry| entry.owner != *owner);
        before - handlers.len()
    }

    pub fn is_registered(&self, rpc: RpcId) -> bool {
        self.handlers.read().contains_key(&rpc)
    }

    pub fn registered_len(&self) -> usize {
        self.handlers.read().len()
    }

    fn entry(&self, rpc: RpcId) -> KernelResult<Arc<RpcEntry>> {
        self.handlers
            .read()
            .get(&rpc)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("rpc {rpc} handler")))
    }

    pub fn call(
        &self,
        bus_identity: usize,
        counters: &BusCounters,
        request: RpcRequest,
        options: CallOptions,
    ) -> KernelResult<RpcFuture> {
        let entry = self.entry(request.rpc)?;
        let key = (bus_identity, request.rpc);
        let guard = if options.deferred {
            None
        } else {
            Some(ActiveCallGuard::enter(key).ok_or_else(|| {
                KernelError::DeadlockDetected(format!(
                    "rpc {} called inline from its own handler",
                    request.rpc
                ))
            })?)
        };

        BusCounters::add(&counters.rpc_calls, 1);
        let shared = FutureShared::new(request.rpc);
        self.track(&shared);

        match guard {
            None => {
                debug!(
                    "event=rpc_call module=rpc status=queued rpc_id={} caller={}",
                    request.rpc,
                    request.caller.name()
                );
                self.deferred.lock().push_back(DeferredCall {
                    request,
                    future: Arc::clone(&shared),
                });
            }
            Some(_guard) => {
                let outcome = invoke(&entry, &request);
                settle(counters, &shared, request.rpc, outcome);
            }
        }
        Ok(RpcFuture::new(shared))
    }

    /// Runs up to `max` deferred calls (`0` = those queued now) on the
    /// calling thread. Cancelled calls are skipped without running.
    pub fn service(&self, bus_identity: usize, counters: &BusCounters, max: usize) -> usize {
        let limit = if max == 0 {
            self.deferred.lock().len()
        } else {
            max
        };
        let mut serviced = 0;
        for _ in 0..limit {
            let Some(call) = self.deferred.lock().pop_front() else {
                break;
            };
            if call.future.state() != FutureState::Pending {
                continue;
            }
            let outcome = match self.entry(call.request.rpc) {
                Ok(entry) => match ActiveCallGuard::enter((bus_identity, call.request.rpc)) {
                    Some(_guard) => invoke(&entry, &call.request),
                    None => Err(KernelError::DeadlockDetected(format!(
                        "rpc {} serviced from its own handler",
                        call.request.rpc
                    ))),
                },
                Err(err) => Err(err),
            };
            settle(counters, &call.future, call.request.rpc, outcome);
            serviced += 1;
        }
        serviced
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Cancels every pending future this table has issued.
    pub fn cancel_pending(&self) -> usize {
        let pending: Vec<Weak<FutureShared>> = std::mem::take(&mut *self.pending.lock());
        self.deferred.lock().clear();
        pending
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|future| future.finish_without_result(FutureState::Cancelled))
            .count()
    }

    fn track(&self, shared: &Arc<FutureShared>) {
        let mut pending = self.pending.lock();
        pending.retain(|weak| {
            weak.upgrade()
                .is_some_and(|future| future.state() == FutureState::Pending)
        });
        pending.push(Arc::downgrade(shared));
    }
}

fn invoke(entry: &RpcEntry, request: &RpcRequest) -> KernelResult<Vec<u8>> {
    let handler = Arc::clone(&entry.handler);
    match catch_unwind(AssertUnwindSafe(|| handler(request))) {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                "event=rpc_handler module=rpc status=error rpc_id={} reason=panic",
                request.rpc
            );
            Err(KernelError::Internal(format!(
                "rpc {} handler panicked",
                request.rpc
            )))
        }
    }
}

fn settle(
    counters: &BusCounters,
    future: &FutureShared,
    rpc: RpcId,
    outcome: KernelResult<Vec<u8>>,
) {
    let failed = outcome.is_err();
    if let Err(err) = &outcome {
        warn!(
            "event=rpc_call module=rpc status=error rpc_id={} error_code={}",
            rpc,
            err.code()
        );
    }
    if future.complete(outcome) {
        let counter = if failed {
            &counters.rpc_failed
        } else {
            &counters.rpc_completed
        };
        BusCounters::add(counter, 1);
    }
}
