//! Inter-mod communication: topics, subscriptions, RPC and futures.
//!
//! Nothing here owns a thread. Publishing only enqueues; subscriber code
//! and deferred RPC handlers run inside `ImcBus::pump` on the pumping
//! thread.

mod bus;
mod future;
mod intern;
mod message;
mod rpc;
mod stats;
mod subscription;

pub use bus::{ImcBus, DEFAULT_BLOCK_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
pub use future::{CompletionCallback, FutureState, RpcFuture};
pub use intern::{RpcId, TopicId};
pub use message::{BufferCleanup, Message, MessageMetadata, Payload, Priority};
pub use rpc::{CallOptions, RpcHandler, RpcRequest};
pub use stats::ImcStats;
pub use subscription::{
    BackpressurePolicy, MessageFilter, MessageHandler, SubscribeOptions, SubscriptionId,
};
