//! 集成测试共用的记录型传输层和本地队列
#![allow(dead_code)]

use async_trait::async_trait;
use limiter_cluster::{
    infra::catalog, ClusterConfig, LimiterError, LimiterEvent, LocalQueue, Result, ScriptOp,
    StoreTransport,
};
use parking_lot::Mutex;
use redis::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// 记录所有调用的传输层
///
/// 每个操作可以预置若干回复，用完后返回 `Value::Int(0)`。
/// 发布的消息只做记录，不会回送给订阅者。
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<(ScriptOp, Vec<String>, Vec<String>)>>,
    replies: Mutex<HashMap<ScriptOp, VecDeque<Result<Value>>>>,
    published: Mutex<Vec<(String, String)>>,
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    unsubscribed: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl RecordingTransport {
    pub fn reply(&self, op: ScriptOp, reply: Result<Value>) {
        self.replies.lock().entry(op).or_default().push_back(reply);
    }

    /// 预置一个脚本错误回复，按真实 Redis 的方式归类
    pub fn reply_error(&self, op: ScriptOp, message: &str) {
        self.reply(op, Err(LimiterError::from_script_reply(message)));
    }

    pub fn ops(&self) -> Vec<ScriptOp> {
        self.calls.lock().iter().map(|(op, _, _)| *op).collect()
    }

    /// 启动流程（init + register_client）之后的操作
    pub fn ops_after_bootstrap(&self) -> Vec<ScriptOp> {
        self.ops().into_iter().skip(2).collect()
    }

    pub fn calls_of(&self, op: ScriptOp) -> Vec<(Vec<String>, Vec<String>)> {
        self.calls
            .lock()
            .iter()
            .filter(|(o, _, _)| *o == op)
            .map(|(_, keys, args)| (keys.clone(), args.clone()))
            .collect()
    }

    pub fn count(&self, op: ScriptOp) -> usize {
        self.calls.lock().iter().filter(|(o, _, _)| *o == op).count()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribers.lock().contains_key(channel)
    }

    /// 模拟其他进程在频道上发布消息
    pub fn inject(&self, channel: &str, message: &str) -> bool {
        match self.subscribers.lock().get(channel) {
            Some(tx) => tx.send(message.to_string()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl StoreTransport for RecordingTransport {
    async fn run_script(&self, op: ScriptOp, keys: Vec<String>, args: Vec<String>) -> Result<Value> {
        self.calls.lock().push((op, keys, args));
        let reply = self
            .replies
            .lock()
            .get_mut(&op)
            .and_then(|queue| queue.pop_front());
        reply.unwrap_or(Ok(Value::Int(0)))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.published
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(channel.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.subscribers.lock().remove(channel);
        self.unsubscribed.lock().push(channel.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.subscribers.lock().clear();
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 记录所有交互的本地队列
pub struct RecordingQueue {
    limiter_id: String,
    queued: AtomicU64,
    /// 单次 drain 最多能消耗的容量，None 表示不限
    absorb: Mutex<Option<u64>>,
    drains: Mutex<Vec<Option<u64>>>,
    dropped: AtomicUsize,
    peer: Mutex<Option<String>>,
    events: Mutex<Vec<LimiterEvent>>,
}

impl RecordingQueue {
    pub fn new(limiter_id: &str) -> Self {
        Self {
            limiter_id: limiter_id.to_string(),
            queued: AtomicU64::new(0),
            absorb: Mutex::new(None),
            drains: Mutex::new(Vec::new()),
            dropped: AtomicUsize::new(0),
            peer: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_queued(&self, n: u64) {
        self.queued.store(n, Ordering::SeqCst);
    }

    pub fn set_absorb(&self, limit: Option<u64>) {
        *self.absorb.lock() = limit;
    }

    pub fn set_peer(&self, peer: Option<&str>) {
        *self.peer.lock() = peer.map(str::to_string);
    }

    pub fn drains(&self) -> Vec<Option<u64>> {
        self.drains.lock().clone()
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<LimiterEvent> {
        self.events.lock().clone()
    }

    pub fn errors(&self) -> Vec<LimiterError> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LimiterEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LimiterEvent::Message(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LocalQueue for RecordingQueue {
    fn queued_count(&self) -> u64 {
        self.queued.load(Ordering::SeqCst)
    }

    async fn drain_capacity(&self, capacity: Option<u64>) -> Result<u64> {
        self.drains.lock().push(capacity);
        let absorb = *self.absorb.lock();
        Ok(match (capacity, absorb) {
            (Some(c), Some(a)) => c.min(a),
            (Some(c), None) => c,
            (None, Some(a)) => a,
            (None, None) => 0,
        })
    }

    fn drop_all_queued(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }

    fn random_peer_id(&self) -> Option<String> {
        self.peer.lock().clone()
    }

    fn channel_name(&self) -> String {
        catalog::channel(&self.limiter_id)
    }

    fn emit(&self, event: LimiterEvent) {
        self.events.lock().push(event);
    }
}

/// 测试用配置：固定 client ID，默认不发心跳
pub fn test_config(limiter_id: &str, client_id: &str) -> ClusterConfig {
    let mut config = ClusterConfig::new(limiter_id);
    config.client_id = Some(client_id.to_string());
    config.heartbeat_interval_ms = None;
    config
}

/// 让后台任务跑完当前能跑的部分
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// 等待条件成立（暂停时间下会自动推进时钟）
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(condition(), "condition not met in time");
}
