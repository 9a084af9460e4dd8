pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod infra;
pub mod logging;
pub mod model;

pub use cluster::{
    BroadcastMessage, DistributedStore, LimiterEvent, LocalQueue, ObserverQueue, ReadyState,
};
pub use config::ClusterConfig;
pub use error::{LimiterError, Result};
pub use infra::{ConnectionMode, ConnectionMultiplexer, EventBus, ScriptOp, StoreTransport};
pub use model::*;
