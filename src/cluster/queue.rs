use async_trait::async_trait;

use crate::error::{LimiterError, Result};

/// 适配器对外发出的事件
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterEvent {
    /// 后台任务（心跳、消息处理、协商超时）中的错误
    Error(LimiterError),
    /// 其他进程通过 `message:` 广播的内容
    Message(String),
    /// 每次原子操作调用前的调试信息
    Debug { description: String, args: Vec<String> },
}

impl LimiterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LimiterEvent::Error(_) => "error",
            LimiterEvent::Message(_) => "message",
            LimiterEvent::Debug { .. } => "debug",
        }
    }
}

/// 本地准入队列
///
/// 任务排序、权重计算、结果回调都由队列自己负责，
/// 适配器只通过下面这些方法与它交互。
#[async_trait]
pub trait LocalQueue: Send + Sync + 'static {
    /// 本地排队中的任务数
    fn queued_count(&self) -> u64;

    /// 用至多 `capacity` 的容量启动排队任务，返回实际消耗的容量
    ///
    /// `None` 表示容量不受限。
    async fn drain_capacity(&self, capacity: Option<u64>) -> Result<u64>;

    /// 丢弃所有排队任务
    fn drop_all_queued(&self);

    /// 随机挑选一个对等进程的客户端 ID（没有可选对象时返回 None）
    fn random_peer_id(&self) -> Option<String>;

    /// 本限流器的广播频道名
    fn channel_name(&self) -> String;

    /// 发出事件
    fn emit(&self, event: LimiterEvent);
}
