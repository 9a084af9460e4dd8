use tokio::sync::broadcast;

use crate::cluster::queue::LimiterEvent;

/// 进程内事件总线
///
/// 把限流器事件（error / message / debug）分发给任意数量的观察者。
/// 没有订阅者时事件直接丢弃。
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LimiterEvent>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn publish(&self, event: LimiterEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
