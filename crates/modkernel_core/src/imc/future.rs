//! Request/response futures for RPC calls.
//!
//! # Invariants
//! - A future leaves `Pending` exactly once; terminal states are final.
//! - Completion callbacks run exactly once, outside the state lock, on the
//!   thread that performed the transition (or on the registering thread when
//!   the future is already terminal).

use super::intern::RpcId;
use crate::error::{KernelError, KernelResult};
use log::error;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
    Pending = 0,
    Ready = 1,
    Cancelled = 2,
    Timeout = 3,
    Failed = 4,
}

impl FutureState {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce(FutureState) + Send>;

struct Slot {
    state: FutureState,
    response: Option<Vec<u8>>,
    failure: Option<(i32, String)>,
    callbacks: Vec<CompletionCallback>,
}

pub(crate) struct FutureShared {
    rpc: RpcId,
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl FutureShared {
    pub fn new(rpc: RpcId) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            slot: Mutex::new(Slot {
                state: FutureState::Pending,
                response: None,
                failure: None,
                callbacks: Vec::new(),
            }),
            changed: Condvar::new(),
        })
    }

    pub fn state(&self) -> FutureState {
        self.slot.lock().state
    }

    /// Stores the handler outcome. Returns `false` when the future was
    /// already terminal, in which case the outcome is discarded.
    pub fn complete(&self, outcome: KernelResult<Vec<u8>>) -> bool {
        let (state, callbacks) = {
            let mut slot = self.slot.lock();
            if slot.state.is_terminal() {
                return false;
            }
            match outcome {
                Ok(response) => {
                    slot.state = FutureState::Ready;
                    slot.response = Some(response);
                }
                Err(err) => {
                    slot.state = FutureState::Failed;
                    slot.failure = Some(failure_of(err));
                }
            }
            (slot.state, std::mem::take(&mut slot.callbacks))
        };
        self.changed.notify_all();
        run_callbacks(self.rpc, state, callbacks);
        true
    }

    /// Moves a pending future into `terminal`. Returns `false` if it had
    /// already left `Pending`.
    pub fn finish_without_result(&self, terminal: FutureState) -> bool {
        let callbacks = {
            let mut slot = self.slot.lock();
            if slot.state.is_terminal() {
                return false;
            }
            slot.state = terminal;
            std::mem::take(&mut slot.callbacks)
        };
        self.changed.notify_all();
        run_callbacks(self.rpc, terminal, callbacks);
        true
    }
}

fn failure_of(err: KernelError) -> (i32, String) {
    match err {
        KernelError::FutureFailed { code, message } => (code, message),
        other => (other.code(), other.to_string()),
    }
}

fn run_callbacks(rpc: RpcId, state: FutureState, callbacks: Vec<CompletionCallback>) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
            error!(
                "event=future_callback module=rpc status=error rpc_id={} reason=panic",
                rpc
            );
        }
    }
}

/// Caller-owned handle to one outstanding RPC call.
///
/// Dropping the future releases it; a late handler result is discarded.
pub struct RpcFuture {
    shared: Arc<FutureShared>,
}

impl RpcFuture {
    pub(crate) fn new(shared: Arc<FutureShared>) -> Self {
        Self { shared }
    }

    pub fn rpc_id(&self) -> RpcId {
        self.shared.rpc
    }

    pub fn state(&self) -> FutureState {
        self.shared.state()
    }

    /// Blocks until the future leaves `Pending`.
    ///
    /// `None` waits without bound. When `timeout` elapses first the future
    /// becomes `Timeout`, which is terminal.
    pub fn wait(&self, timeout: Option<Duration>) -> FutureState {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        {
            let mut slot = self.shared.slot.lock();
            while slot.state == FutureState::Pending {
                match deadline {
                    Some(deadline) => {
                        if self.shared.changed.wait_until(&mut slot, deadline).timed_out() {
                            break;
                        }
                    }
                    None => self.shared.changed.wait(&mut slot),
                }
            }
            if slot.state.is_terminal() {
                return slot.state;
            }
        }
        self.shared.finish_without_result(FutureState::Timeout);
        self.state()
    }

    /// Returns a copy of the response, or the terminal error.
    pub fn result(&self) -> KernelResult<Vec<u8>> {
        let slot = self.shared.slot.lock();
        match slot.state {
            FutureState::Ready => Ok(slot.response.clone().unwrap_or_default()),
            FutureState::Pending => Err(KernelError::WouldBlock(format!(
                "rpc {} has not completed",
                self.shared.rpc
            ))),
            FutureState::Cancelled => Err(KernelError::FutureCancelled),
            FutureState::Timeout => Err(KernelError::Timeout(format!(
                "rpc {} timed out",
                self.shared.rpc
            ))),
            FutureState::Failed => {
                let (code, message) = slot
                    .failure
                    .clone()
                    .unwrap_or((crate::error::CODE_INTERNAL, String::new()));
                Err(KernelError::FutureFailed { code, message })
            }
        }
    }

    /// Cancels a pending future. A handler already running is not
    /// interrupted; its result is discarded. Returns `false` if terminal.
    pub fn cancel(&self) -> bool {
        self.shared.finish_without_result(FutureState::Cancelled)
    }

    /// Runs `callback` once the future is terminal; immediately if it is.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(FutureState) + Send + 'static,
    {
        let state = {
            let mut slot = self.shared.slot.lock();
            if slot.state == FutureState::Pending {
                slot.callbacks.push(Box::new(callback));
                return;
            }
            slot.state
        };
        run_callbacks(self.shared.rpc, state, vec![Box::new(callback)]);
    }

    /// Releases the caller's ownership.
    pub fn release(self) {}
}

impl std::fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFuture")
            .field("rpc", &self.shared.rpc)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{FutureShared, FutureState, RpcFuture};
    use crate::error::KernelError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn first_terminal_transition_wins() {
        let shared = FutureShared::new(3);
        let future = RpcFuture::new(Arc::clone(&shared));

        assert!(future.cancel());
        assert!(!shared.complete(Ok(vec![1])));
        assert_eq!(future.state(), FutureState::Cancelled);
        assert!(matches!(future.result(), Err(KernelError::FutureCancelled)));
    }

    #[test]
    fn wait_times_out_into_terminal_state() {
        let shared = FutureShared::new(1);
        let future = RpcFuture::new(Arc::clone(&shared));

        assert_eq!(
            future.wait(Some(Duration::from_millis(5))),
            FutureState::Timeout
        );
        assert!(!shared.complete(Ok(Vec::new())));
        assert!(matches!(future.result(), Err(KernelError::Timeout(_))));
    }

    #[test]
    fn failure_keeps_handler_code_and_message() {
        let shared = FutureShared::new(1);
        let future = RpcFuture::new(Arc::clone(&shared));
        shared.complete(Err(KernelError::FutureFailed {
            code: -42,
            message: "bad request".to_string(),
        }));

        match future.result() {
            Err(KernelError::FutureFailed { code, message }) => {
                assert_eq!(code, -42);
                assert_eq!(message, "bad request");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn callbacks_fire_once_before_and_after_completion() {
        let shared = FutureShared::new(1);
        let future = RpcFuture::new(Arc::clone(&shared));
        let calls = Arc::new(AtomicUsize::new(0));

        let early = Arc::clone(&calls);
        future.on_complete(move |state| {
            assert_eq!(state, FutureState::Ready);
            early.fetch_add(1, Ordering::SeqCst);
        });
        shared.complete(Ok(b"ok".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&calls);
        future.on_complete(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(future.result().expect("ready"), b"ok".to_vec());
    }

    #[test]
    fn wait_wakes_on_completion_from_another_thread() {
        let shared = FutureShared::new(1);
        let future = RpcFuture::new(Arc::clone(&shared));
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            shared.complete(Ok(vec![9]));
        });

        assert_eq!(future.wait(None), FutureState::Ready);
        worker.join().expect("worker thread");
    }
}
