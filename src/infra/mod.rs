// Infrastructure layer - 基础设施层
// 负责共享存储访问：原子操作目录、Redis 传输、连接复用、事件总线、指标

pub mod catalog;
pub mod event_bus;
pub mod metrics;
pub mod multiplexer;
pub mod redis;
pub mod transport;

// 重新导出主要类型
pub use catalog::ScriptOp;
pub use event_bus::EventBus;
pub use multiplexer::{ConnectionMode, ConnectionMultiplexer, Connector};
pub use redis::RedisTransport;
pub use transport::StoreTransport;
