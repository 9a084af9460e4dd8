//! 集群协调层
//!
//! 把本地限流队列接入共享存储：原子操作调用与自愈、心跳、
//! 广播消息处理和 capacity-priority 协商。

pub mod heartbeat;
pub mod message;
pub mod negotiation;
pub mod observer;
pub mod queue;
pub mod recovery;
pub mod store;

pub use message::BroadcastMessage;
pub use observer::ObserverQueue;
pub use queue::{LimiterEvent, LocalQueue};
pub use recovery::Recovery;
pub use store::{DistributedStore, ReadyState};
