// RedisTransport - 共享存储的 Redis 实现
// 原子操作走 bb8-redis 连接池，订阅走一条独立的 pub/sub 连接

use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::PubSubSink;
use redis::{AsyncCommands, Script, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::catalog::ScriptOp;
use super::transport::StoreTransport;
use crate::config::RedisConfig;
use crate::error::{LimiterError, Result};

/// 频道 -> 本进程内的接收者
#[derive(Clone, Default)]
struct ChannelRoutes(Arc<DashMap<String, Vec<mpsc::UnboundedSender<String>>>>);

impl ChannelRoutes {
    /// 登记一个接收者
    ///
    /// 频道的第一个接收者负责执行 `subscribe`；失败时撤销整个频道的登记，
    /// 下一次 attach 会重新订阅。
    async fn attach<F, Fut>(
        &self,
        channel: &str,
        subscribe: F,
    ) -> Result<mpsc::UnboundedReceiver<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut receivers = self.0.entry(channel.to_string()).or_default();
            receivers.push(tx);
            receivers.len() == 1
        };

        if first {
            if let Err(e) = subscribe().await {
                self.0.remove(channel);
                return Err(e);
            }
        }
        Ok(rx)
    }

    /// 投递一条消息，顺便清理已关闭的接收者；返回剩余接收者数
    fn dispatch(&self, channel: &str, payload: &str) -> usize {
        match self.0.get_mut(channel) {
            Some(mut receivers) => {
                receivers.retain(|tx| tx.send(payload.to_string()).is_ok());
                receivers.len()
            }
            None => 0,
        }
    }

    fn remove(&self, channel: &str) -> bool {
        self.0.remove(channel).is_some()
    }

    fn clear(&self) {
        self.0.clear();
    }

    #[cfg(test)]
    fn contains(&self, channel: &str) -> bool {
        self.0.contains_key(channel)
    }
}

/// Redis 传输层（连接池 + 订阅连接）
pub struct RedisTransport {
    pool: Arc<Pool<RedisConnectionManager>>,
    /// 单条 Redis 命令的执行超时
    command_timeout: Duration,
    scripts: HashMap<ScriptOp, Script>,
    subscriber: Mutex<Option<PubSubSink>>,
    routes: ChannelRoutes,
    router: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisTransport {
    /// 建立连接池和订阅连接
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.clone()).map_err(|e| {
            LimiterError::Redis(format!("Failed to create Redis manager: {}", e))
        })?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await
            .map_err(|e| LimiterError::Redis(format!("Failed to create Redis pool: {}", e)))?;

        // 测试连接
        {
            let mut conn = pool.get().await.map_err(|e| {
                LimiterError::Redis(format!("Failed to get Redis connection: {}", e))
            })?;

            let _: String = conn
                .ping()
                .await
                .map_err(|e| LimiterError::Redis(format!("Redis ping failed: {}", e)))?;
        }

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| LimiterError::Redis(format!("Invalid Redis url: {}", e)))?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| LimiterError::Redis(format!("Failed to open pub/sub connection: {}", e)))?;
        let (sink, mut stream) = pubsub.split();

        let routes = ChannelRoutes::default();
        let router_routes = routes.clone();
        let router = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("⚠️ 无法解码频道 {} 的消息: {}", channel, e);
                        continue;
                    }
                };
                router_routes.dispatch(&channel, &payload);
            }
            tracing::debug!("订阅连接已结束");
        });

        let mut scripts = HashMap::new();
        for op in ScriptOp::ALL {
            let source = op.source().ok_or_else(|| {
                LimiterError::Configuration(format!("No script embedded for {}", op))
            })?;
            scripts.insert(op, Script::new(&source));
        }

        let command_timeout = config.command_timeout();

        tracing::info!(
            "✅ Redis 连接已建立 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms, idle_timeout={}s)",
            config.pool_size,
            config.min_idle,
            config.connection_timeout_secs,
            config.command_timeout_ms,
            config.idle_timeout_secs,
        );

        Ok(Self {
            pool: Arc::new(pool),
            command_timeout,
            scripts,
            subscriber: Mutex::new(Some(sink)),
            routes,
            router: parking_lot::Mutex::new(Some(router)),
            closed: AtomicBool::new(false),
        })
    }

    /// 获取连接池状态（活跃连接数、空闲连接数）
    pub fn pool_state(&self) -> bb8::State {
        self.pool.state()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LimiterError::Disconnected);
        }
        Ok(())
    }

    /// 从连接池获取连接
    async fn get_conn(&self) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| LimiterError::Redis(format!("Failed to get Redis connection: {}", e)))
    }

    /// 执行带超时的 Redis 操作
    async fn with_timeout<F, T>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| {
                LimiterError::Timeout(format!(
                    "Redis command timeout ({}ms)",
                    self.command_timeout.as_millis()
                ))
            })?
    }
}

#[async_trait]
impl StoreTransport for RedisTransport {
    async fn run_script(
        &self,
        op: ScriptOp,
        keys: Vec<String>,
        args: Vec<String>,
    ) -> Result<Value> {
        self.ensure_open()?;
        let script = self
            .scripts
            .get(&op)
            .ok_or_else(|| LimiterError::Configuration(format!("No script loaded for {}", op)))?;

        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut invocation = script.prepare_invoke();
            for key in &keys {
                invocation.key(key);
            }
            for arg in &args {
                invocation.arg(arg);
            }
            let value: Value = invocation.invoke_async(&mut *conn).await?;
            Ok(value)
        })
        .await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.ensure_open()?;
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.publish::<_, _, ()>(channel, message)
                .await
                .map_err(|e| LimiterError::Redis(format!("Redis PUBLISH failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        self.ensure_open()?;
        self.routes
            .attach(channel, move || async move {
                let mut guard = self.subscriber.lock().await;
                let sink = guard.as_mut().ok_or(LimiterError::Disconnected)?;
                self.with_timeout(async {
                    sink.subscribe(channel).await.map_err(|e| {
                        LimiterError::Redis(format!("Redis SUBSCRIBE failed: {}", e))
                    })
                })
                .await?;
                tracing::debug!("📡 已订阅频道 {}", channel);
                Ok(())
            })
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if !self.routes.remove(channel) {
            return Ok(());
        }
        let mut guard = self.subscriber.lock().await;
        if let Some(sink) = guard.as_mut() {
            self.with_timeout(async {
                sink.unsubscribe(channel)
                    .await
                    .map_err(|e| LimiterError::Redis(format!("Redis UNSUBSCRIBE failed: {}", e)))
            })
            .await?;
            tracing::debug!("📴 已取消订阅频道 {}", channel);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.routes.clear();
        // 丢弃 sink 即关闭订阅连接
        self.subscriber.lock().await.take();
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        tracing::info!("🔌 Redis 连接已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_failed_subscribe_leaves_no_route() {
        let routes = ChannelRoutes::default();

        let err = routes
            .attach("b_group", || async {
                Err(LimiterError::Timeout("Redis command timeout (50ms)".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LimiterError::Timeout(_)));
        assert!(!routes.contains("b_group"));
        assert_eq!(routes.dispatch("b_group", "capacity:1"), 0);

        // 重新 attach 时再次订阅，且只订阅一次
        let subscribes = AtomicUsize::new(0);
        let mut first = routes
            .attach("b_group", || {
                subscribes.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();
        let second = routes
            .attach("b_group", || {
                subscribes.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);

        assert_eq!(routes.dispatch("b_group", "capacity:5"), 2);
        assert_eq!(first.recv().await.as_deref(), Some("capacity:5"));

        drop(second);
        assert_eq!(routes.dispatch("b_group", "capacity:6"), 1);
        assert_eq!(first.recv().await.as_deref(), Some("capacity:6"));
    }

    #[tokio::test]
    async fn test_remove_and_clear_drop_routes() {
        let routes = ChannelRoutes::default();
        let mut rx = routes
            .attach("b_a", || async { Ok(()) })
            .await
            .unwrap();
        routes.attach("b_b", || async { Ok(()) }).await.unwrap();

        assert!(routes.remove("b_a"));
        assert!(!routes.remove("b_a"));
        assert_eq!(rx.recv().await, None);

        routes.clear();
        assert!(!routes.contains("b_b"));
    }
}
