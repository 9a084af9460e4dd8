use async_trait::async_trait;
use tracing::{debug, trace};

use super::queue::{LimiterEvent, LocalQueue};
use crate::error::Result;
use crate::infra::catalog;
use crate::infra::event_bus::EventBus;

/// 只观察、不运行任务的本地队列
///
/// 命令行工具用它接入集群：没有排队任务，收到的容量全部放弃，
/// 事件转发到 `EventBus`。
pub struct ObserverQueue {
    limiter_id: String,
    bus: EventBus,
}

impl ObserverQueue {
    pub fn new(limiter_id: impl Into<String>, bus: EventBus) -> Self {
        Self {
            limiter_id: limiter_id.into(),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[async_trait]
impl LocalQueue for ObserverQueue {
    fn queued_count(&self) -> u64 {
        0
    }

    async fn drain_capacity(&self, capacity: Option<u64>) -> Result<u64> {
        trace!("observer {} 放弃容量 {:?}", self.limiter_id, capacity);
        Ok(0)
    }

    fn drop_all_queued(&self) {
        debug!("observer {} 收到 blocked，无排队任务可丢弃", self.limiter_id);
    }

    fn random_peer_id(&self) -> Option<String> {
        None
    }

    fn channel_name(&self) -> String {
        catalog::channel(&self.limiter_id)
    }

    fn emit(&self, event: LimiterEvent) {
        self.bus.publish(event);
    }
}
