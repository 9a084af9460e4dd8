//! 分布式存储适配器
//!
//! 每个本地限流器一个实例。负责：
//! 1. 通过原子操作目录读写共享状态，遇到状态丢失时自愈
//! 2. 心跳维持本进程的 Client Record
//! 3. 订阅广播频道，按消息类型分发处理
//! 4. 通过 capacity-priority 协商在多个进程之间公平分配空出的容量
//!
//! 后台任务（启动流程、订阅循环、心跳、协商计时器）都归适配器所有，
//! `disconnect` 或 drop 时全部取消。

use parking_lot::Mutex;
use redis::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::heartbeat::Heartbeat;
use super::message::BroadcastMessage;
use super::negotiation::NegotiationTimers;
use super::queue::{LimiterEvent, LocalQueue};
use super::recovery::{run_with_recovery, Recovery};
use crate::config::ClusterConfig;
use crate::error::{LimiterError, Result};
use crate::infra::catalog::{self, ScriptOp};
use crate::infra::metrics;
use crate::infra::multiplexer::ConnectionMultiplexer;
use crate::infra::transport::StoreTransport;
use crate::model::reply::{self, FreeReply, LimiterStatus, RegisterReply, SubmitReply};
use crate::model::settings::{LimiterSettings, SettingChange};

/// 适配器就绪状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Ready,
    Failed(String),
    Disconnected,
}

#[derive(Default)]
struct Tasks {
    bootstrap: Option<JoinHandle<()>>,
    subscription: Option<JoinHandle<()>>,
    heartbeat: Option<Heartbeat>,
}

struct Inner {
    limiter_id: String,
    client_id: String,
    queue: Arc<dyn LocalQueue>,
    multiplexer: Arc<ConnectionMultiplexer>,
    transport: OnceLock<Arc<dyn StoreTransport>>,
    /// 本地保存的 Settings Record，用于 init 自愈
    settings: Mutex<LimiterSettings>,
    clear_datastore: bool,
    heartbeat_interval: Option<Duration>,
    negotiations: Arc<NegotiationTimers>,
    ready: watch::Sender<ReadyState>,
    tasks: Mutex<Tasks>,
    /// 最近一次调用的时间戳（毫秒），保证单调不减
    clock: AtomicI64,
    attached: AtomicBool,
    disconnected: AtomicBool,
}

/// 分布式存储适配器
pub struct DistributedStore {
    inner: Arc<Inner>,
}

impl DistributedStore {
    /// 创建适配器并在后台开始启动流程：
    /// attach → init → 订阅广播频道 → register_client → 启动心跳
    pub fn new(
        config: &ClusterConfig,
        queue: Arc<dyn LocalQueue>,
        multiplexer: Arc<ConnectionMultiplexer>,
    ) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let (ready, _) = watch::channel(ReadyState::Pending);

        let inner = Arc::new(Inner {
            limiter_id: config.limiter.id.clone(),
            client_id,
            queue,
            multiplexer,
            transport: OnceLock::new(),
            settings: Mutex::new(config.limiter.clone()),
            clear_datastore: config.clear_datastore,
            heartbeat_interval: config.heartbeat_interval(),
            negotiations: NegotiationTimers::new(config.capacity_priority_timeout()),
            ready,
            tasks: Mutex::new(Tasks::default()),
            clock: AtomicI64::new(0),
            attached: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        });

        let bootstrap = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move { inner.bootstrap().await })
        };
        inner.tasks.lock().bootstrap = Some(bootstrap);

        Self { inner }
    }

    /// 创建适配器并等待启动完成
    pub async fn connect(
        config: &ClusterConfig,
        queue: Arc<dyn LocalQueue>,
        multiplexer: Arc<ConnectionMultiplexer>,
    ) -> Result<Self> {
        let store = Self::new(config, queue, multiplexer);
        store.ready().await?;
        Ok(store)
    }

    /// 等待启动流程完成
    pub async fn ready(&self) -> Result<()> {
        self.inner.wait_ready().await
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.ready.borrow().clone()
    }

    pub fn limiter_id(&self) -> &str {
        &self.inner.limiter_id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// 本地保存的 Settings Record 副本
    pub fn settings(&self) -> LimiterSettings {
        self.inner.settings.lock().clone()
    }

    /// 尚未结束的 capacity-priority 协商数
    pub fn pending_negotiations(&self) -> usize {
        self.inner.negotiations.pending()
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.inner
            .tasks
            .lock()
            .heartbeat
            .as_ref()
            .map(Heartbeat::is_running)
            .unwrap_or(false)
    }

    // ==================== 原子操作 ====================

    /// 申请以 `weight` 的权重运行任务 `index`
    pub async fn register(
        &self,
        index: &str,
        weight: u64,
        expiration: Option<u64>,
    ) -> Result<RegisterReply> {
        let args = vec![
            index.to_string(),
            weight.to_string(),
            expiration.map(|e| e.to_string()).unwrap_or_default(),
        ];
        let value = self.inner.run_script(ScriptOp::Register, args).await?;
        RegisterReply::from_value(&value)
    }

    /// 提交一个任务进入本地队列前的检查
    ///
    /// 权重超过 maxConcurrent 时返回 `LimiterError::Overweight`。
    pub async fn submit(&self, queue_length: u64, weight: u64) -> Result<SubmitReply> {
        let args = vec![queue_length.to_string(), weight.to_string()];
        let value = self.inner.run_script(ScriptOp::Submit, args).await?;
        SubmitReply::from_value(&value)
    }

    pub async fn free(&self, index: &str) -> Result<FreeReply> {
        let value = self
            .inner
            .run_script(ScriptOp::Free, vec![index.to_string()])
            .await?;
        FreeReply::from_value(&value)
    }

    pub async fn done(&self) -> Result<u64> {
        let value = self.inner.run_script(ScriptOp::Done, Vec::new()).await?;
        reply::as_u64(&value)
    }

    pub async fn running(&self) -> Result<u64> {
        let value = self.inner.run_script(ScriptOp::Running, Vec::new()).await?;
        reply::as_u64(&value)
    }

    /// 所有存活进程排队任务的总数
    pub async fn queued(&self) -> Result<u64> {
        let value = self.inner.run_script(ScriptOp::Queued, Vec::new()).await?;
        reply::as_u64(&value)
    }

    /// 当前 reservoir；未启用时为 None
    pub async fn current_reservoir(&self) -> Result<Option<i64>> {
        let value = self
            .inner
            .run_script(ScriptOp::CurrentReservoir, Vec::new())
            .await?;
        reply::as_opt_i64(&value)
    }

    /// 依次读取 running、queued、done 和 reservoir
    pub async fn status(&self) -> Result<LimiterStatus> {
        Ok(LimiterStatus {
            limiter_id: self.inner.limiter_id.clone(),
            client_id: self.inner.client_id.clone(),
            running: self.running().await?,
            queued: self.queued().await?,
            done: self.done().await?,
            reservoir: self.current_reservoir().await?,
        })
    }

    pub async fn increment_reservoir(&self, delta: i64) -> Result<i64> {
        let value = self
            .inner
            .run_script(ScriptOp::IncrementReservoir, vec![delta.to_string()])
            .await?;
        reply::as_i64(&value)
    }

    /// 以 `weight` 的权重现在能否立即运行
    pub async fn check(&self, weight: u64) -> Result<bool> {
        let value = self
            .inner
            .run_script(ScriptOp::Check, vec![weight.to_string()])
            .await?;
        reply::as_bool(&value)
    }

    /// 整组状态是否已过期
    pub async fn group_check(&self) -> Result<bool> {
        let value = self
            .inner
            .run_script(ScriptOp::GroupCheck, Vec::new())
            .await?;
        reply::as_bool(&value)
    }

    /// 修改共享配置，成功后同步到本地副本
    pub async fn update_settings(&self, changes: Vec<SettingChange>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let args = SettingChange::to_script_args(&changes);
        self.inner.run_script(ScriptOp::UpdateSettings, args).await?;
        self.inner.settings.lock().apply(&changes);
        Ok(())
    }

    // ==================== 广播 ====================

    /// 宣布空出了 `amount` 的容量
    ///
    /// 有对等进程时随机指定一个优先认领，否则直接广播 `capacity`。
    pub async fn announce_capacity(&self, amount: Option<u64>) -> Result<()> {
        let message = match self.inner.queue.random_peer_id() {
            Some(target) => BroadcastMessage::CapacityPriority {
                amount,
                target: Some(target),
                counter: uuid::Uuid::new_v4().simple().to_string(),
            },
            None => BroadcastMessage::Capacity { amount },
        };
        self.inner.publish(&message).await
    }

    /// 向所有进程广播一条 `message:` 消息
    pub async fn broadcast_message(&self, payload: &str) -> Result<()> {
        self.inner
            .publish(&BroadcastMessage::Message(payload.to_string()))
            .await
    }

    /// 广播 `blocked:`，所有进程丢弃本地排队任务
    pub async fn broadcast_blocked(&self, payload: &str) -> Result<()> {
        self.inner
            .publish(&BroadcastMessage::Blocked(payload.to_string()))
            .await
    }

    /// 处理一条广播消息，返回本地消耗的容量
    ///
    /// 处理失败时发出 error 事件并返回 None，不会向上传播。
    pub async fn handle_message(&self, raw: &str) -> Option<u64> {
        self.inner.handle_message(raw).await
    }

    // ==================== 生命周期 ====================

    /// 断开连接：取消心跳、订阅和全部协商计时器，然后 detach
    ///
    /// 共享连接只减少引用计数；独占连接直接关闭并返回关闭结果。
    pub async fn disconnect(&self) -> Result<()> {
        if self.inner.disconnected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.cancel_tasks();
        self.inner.ready.send_replace(ReadyState::Disconnected);

        if !self.inner.attached.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mode = self.inner.multiplexer.mode();
        self.inner.multiplexer.detach(&self.inner.limiter_id).await?;
        info!(
            "👋 限流器 {} (client={}) 已断开 ({:?})",
            self.inner.limiter_id, self.inner.client_id, mode
        );
        Ok(())
    }
}

impl Drop for DistributedStore {
    fn drop(&mut self) {
        self.inner.cancel_tasks();
    }
}

impl Inner {
    async fn bootstrap(self: Arc<Self>) {
        match self.clone().try_bootstrap().await {
            Ok(()) => {
                info!(
                    "✅ 限流器 {} 已就绪 (client={})",
                    self.limiter_id, self.client_id
                );
                self.ready.send_replace(ReadyState::Ready);
            }
            Err(e) => {
                if self.disconnected.load(Ordering::Acquire) {
                    return;
                }
                error!("❌ 限流器 {} 启动失败: {}", self.limiter_id, e);
                self.ready.send_replace(ReadyState::Failed(e.to_string()));
                self.queue.emit(LimiterEvent::Error(e));
            }
        }
    }

    async fn try_bootstrap(self: Arc<Self>) -> Result<()> {
        let transport = self.multiplexer.attach(&self.limiter_id).await?;
        self.attached.store(true, Ordering::Release);
        let _ = self.transport.set(Arc::clone(&transport));

        let init_args = self.init_args(self.clear_datastore);
        self.run_script(ScriptOp::Init, init_args).await?;

        let channel = self.queue.channel_name();
        let receiver = transport.subscribe(&channel).await?;
        let subscription = self.spawn_subscription(receiver);
        self.tasks.lock().subscription = Some(subscription);

        let queued = self.queue.queued_count();
        self.run_script(ScriptOp::RegisterClient, vec![queued.to_string()])
            .await?;

        if let Some(interval) = self.heartbeat_interval {
            let heartbeat = self.spawn_heartbeat(interval);
            self.tasks.lock().heartbeat = Some(heartbeat);
        }

        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(reason) => return Err(LimiterError::NotReady(reason)),
                ReadyState::Disconnected => return Err(LimiterError::Disconnected),
                ReadyState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(LimiterError::Disconnected);
            }
        }
    }

    fn transport(&self) -> Result<&Arc<dyn StoreTransport>> {
        self.transport
            .get()
            .ok_or_else(|| LimiterError::NotReady("connection not established".to_string()))
    }

    /// 单调不减的毫秒时间戳
    fn now_ms(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let previous = self.clock.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }

    fn init_args(&self, clear: bool) -> Vec<String> {
        let settings = self.settings.lock().clone();
        let mut args = vec![
            if clear { "1" } else { "0" }.to_string(),
            settings.version.clone(),
        ];
        args.extend(settings.to_script_args());
        args
    }

    /// 执行原子操作，遇到哨兵错误时按 `Recovery` 自愈一次
    async fn run_script(&self, op: ScriptOp, args: Vec<String>) -> Result<Value> {
        if !op.is_bootstrap() {
            self.wait_ready().await?;
        }

        let args = args.as_slice();
        let result = run_with_recovery(
            op,
            move || self.execute(op, args),
            move |recovery| self.recover(recovery),
        )
        .await?;

        Ok(result.unwrap_or(Value::Nil))
    }

    /// 单次调用，不做任何重试
    async fn execute(&self, op: ScriptOp, args: &[String]) -> Result<Value> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(LimiterError::Disconnected);
        }
        let transport = self.transport()?;

        let mut stamped = Vec::with_capacity(args.len() + 2);
        stamped.push(self.now_ms().to_string());
        stamped.push(self.client_id.clone());
        stamped.extend(args.iter().cloned());

        debug!("📜 {} {} {:?}", self.limiter_id, op, args);
        self.queue.emit(LimiterEvent::Debug {
            description: format!("Calling Redis script: {}.lua", op),
            args: stamped.clone(),
        });
        metrics::record_script_call(op.name());

        transport
            .run_script(op, catalog::keys(&self.limiter_id), stamped)
            .await
    }

    async fn recover(&self, recovery: Recovery) -> Result<()> {
        match recovery {
            Recovery::Reinitialize => {
                let args = self.init_args(false);
                self.execute(ScriptOp::Init, &args).await?;
            }
            Recovery::RegisterClient => {
                let queued = self.queue.queued_count();
                self.execute(ScriptOp::RegisterClient, &[queued.to_string()])
                    .await?;
            }
            Recovery::Ignore => {}
        }
        Ok(())
    }

    async fn publish(&self, message: &BroadcastMessage) -> Result<()> {
        self.wait_ready().await?;
        let channel = self.queue.channel_name();
        let payload = message.to_string();
        debug!("📣 {} <- {}", channel, payload);
        self.transport()?.publish(&channel, &payload).await
    }

    fn report(&self, err: LimiterError) {
        self.queue.emit(LimiterEvent::Error(err));
    }

    fn spawn_subscription(self: &Arc<Self>, mut receiver: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(raw) = receiver.recv().await {
                inner.handle_message(&raw).await;
            }
            debug!("限流器 {} 的订阅已结束", inner.limiter_id);
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> Heartbeat {
        let inner = Arc::clone(self);
        Heartbeat::spawn(interval, move || {
            let inner = Arc::clone(&inner);
            async move {
                if let Err(e) = inner.run_script(ScriptOp::Heartbeat, Vec::new()).await {
                    metrics::record_heartbeat_failure();
                    warn!("💔 限流器 {} 心跳失败: {}", inner.limiter_id, e);
                    inner.report(e);
                }
            }
        })
    }

    async fn handle_message(self: &Arc<Self>, raw: &str) -> Option<u64> {
        let result = match BroadcastMessage::parse(raw) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(drained) => drained,
            Err(e) => {
                error!("限流器 {} 处理消息 {:?} 失败: {}", self.limiter_id, raw, e);
                self.report(e);
                None
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: BroadcastMessage) -> Result<Option<u64>> {
        metrics::record_message(message.kind());

        match message {
            BroadcastMessage::Capacity { amount } => {
                self.queue.drain_capacity(amount).await.map(Some)
            }
            BroadcastMessage::CapacityPriority {
                amount,
                target,
                counter,
            } => self.negotiate(amount, target, counter).await,
            BroadcastMessage::Message(payload) => {
                self.queue.emit(LimiterEvent::Message(payload));
                Ok(None)
            }
            BroadcastMessage::Blocked(_) => {
                info!("⛔ 限流器 {} 已阻塞，丢弃全部排队任务", self.limiter_id);
                self.queue.drop_all_queued();
                Ok(None)
            }
        }
    }

    async fn negotiate(
        self: &Arc<Self>,
        amount: Option<u64>,
        target: Option<String>,
        counter: String,
    ) -> Result<Option<u64>> {
        match target {
            // 指定了本进程：尽量认领，剩余部分（可能为 0）交给先到者
            // 空 target 的消息同时让其他进程结束等待
            Some(target) if target == self.client_id => {
                let drained = self.queue.drain_capacity(amount).await?;
                self.negotiations.clear(&counter);

                let remainder = amount.map(|amount| amount.saturating_sub(drained));
                self.publish(&BroadcastMessage::CapacityPriority {
                    amount: remainder,
                    target: None,
                    counter,
                })
                .await?;
                Ok(Some(drained))
            }
            // 协商已结束：先到先得
            None => {
                self.negotiations.clear(&counter);
                if amount == Some(0) {
                    return Ok(Some(0));
                }
                self.queue.drain_capacity(amount).await.map(Some)
            }
            // 指定了其他进程：等待对方认领，超时则拉黑并本地兜底
            Some(target) => {
                let inner = Arc::clone(self);
                self.negotiations.start(&counter, async move {
                    inner.claim_abandoned(target, amount).await;
                });
                Ok(None)
            }
        }
    }

    async fn claim_abandoned(&self, target: String, amount: Option<u64>) {
        metrics::record_negotiation_timeout();
        warn!(
            "⏱️ 客户端 {} 未在 {}ms 内认领容量，加入黑名单并由本进程兜底",
            target,
            self.negotiations.timeout().as_millis()
        );

        let result = async {
            self.run_script(ScriptOp::BlacklistClient, vec![target])
                .await?;
            self.queue.drain_capacity(amount).await
        }
        .await;

        if let Err(e) = result {
            if !self.disconnected.load(Ordering::Acquire) {
                self.report(e);
            }
        }
    }

    fn cancel_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if let Some(bootstrap) = tasks.bootstrap.take() {
            bootstrap.abort();
        }
        if let Some(subscription) = tasks.subscription.take() {
            subscription.abort();
        }
        if let Some(heartbeat) = tasks.heartbeat.take() {
            heartbeat.stop();
        }
        drop(tasks);
        self.negotiations.cancel_all();
    }
}
