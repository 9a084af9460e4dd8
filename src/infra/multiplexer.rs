//! 连接复用器
//!
//! 一组物理连接（脚本连接池 + 订阅连接）被多个限流器共享，
//! 按限流器 ID 计数，最后一个使用者 detach 时才真正关闭。
//! 独占模式下每次 detach 都直接关闭。

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::catalog;
use super::redis::RedisTransport;
use super::transport::StoreTransport;
use crate::config::RedisConfig;
use crate::error::Result;

/// 建立物理连接的工厂
pub type Connector =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn StoreTransport>>> + Send + Sync>;

/// 连接归属方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 多个限流器共享，引用计数归零时关闭
    Shared,
    /// 单个限流器独占，detach 即关闭
    Dedicated,
}

#[derive(Default)]
struct MuxState {
    transport: Option<Arc<dyn StoreTransport>>,
    refs: HashMap<String, usize>,
}

/// 连接复用器
pub struct ConnectionMultiplexer {
    connector: Connector,
    mode: ConnectionMode,
    state: Mutex<MuxState>,
}

impl ConnectionMultiplexer {
    pub fn new(connector: Connector, mode: ConnectionMode) -> Self {
        Self {
            connector,
            mode,
            state: Mutex::new(MuxState::default()),
        }
    }

    /// 基于 Redis 配置创建
    pub fn redis(config: RedisConfig, mode: ConnectionMode) -> Self {
        let config = Arc::new(config);
        let connector: Connector = Arc::new(move || {
            let config = Arc::clone(&config);
            Box::pin(async move {
                let transport = RedisTransport::connect(&config).await?;
                Ok(Arc::new(transport) as Arc<dyn StoreTransport>)
            })
        });
        Self::new(connector, mode)
    }

    /// 复用已有连接（例如测试或自定义传输层）
    pub fn with_transport(transport: Arc<dyn StoreTransport>, mode: ConnectionMode) -> Self {
        let connector: Connector = Arc::new(move || {
            let transport = Arc::clone(&transport);
            Box::pin(async move { Ok(transport) })
        });
        Self::new(connector, mode)
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// 获取（必要时建立）物理连接，并为该限流器计数 +1
    pub async fn attach(&self, limiter_id: &str) -> Result<Arc<dyn StoreTransport>> {
        let mut state = self.state.lock().await;

        let transport = match &state.transport {
            Some(transport) => Arc::clone(transport),
            None => {
                let transport = (self.connector)().await?;
                info!("🔗 已建立共享存储连接 ({:?})", self.mode);
                state.transport = Some(Arc::clone(&transport));
                transport
            }
        };

        *state.refs.entry(limiter_id.to_string()).or_insert(0) += 1;
        debug!(
            "限流器 {} attach，引用数 {}",
            limiter_id, state.refs[limiter_id]
        );

        Ok(transport)
    }

    /// 为该限流器计数 -1；计数归零时取消订阅，无人使用时关闭物理连接
    ///
    /// 关闭失败会返回给调用方。
    pub async fn detach(&self, limiter_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        if self.mode == ConnectionMode::Dedicated {
            state.refs.clear();
            if let Some(transport) = state.transport.take() {
                transport.close().await?;
                info!("🔌 限流器 {} 的独占连接已关闭", limiter_id);
            }
            return Ok(());
        }

        let remaining = match state.refs.get_mut(limiter_id) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return Ok(()),
        };

        if remaining > 0 {
            debug!("限流器 {} detach，剩余引用数 {}", limiter_id, remaining);
            return Ok(());
        }

        state.refs.remove(limiter_id);
        let last = state.refs.is_empty();
        let transport = if last {
            state.transport.take()
        } else {
            state.transport.clone()
        };
        let Some(transport) = transport else {
            return Ok(());
        };

        // 取消订阅失败也要关闭最后一条共享连接
        let unsubscribed = transport.unsubscribe(&catalog::channel(limiter_id)).await;
        if !last {
            return unsubscribed;
        }

        let closed = transport.close().await;
        if closed.is_ok() {
            info!("🔌 最后一个限流器已 detach，共享连接已关闭");
        }
        unsubscribed.and(closed)
    }

    /// 当前 attach 的限流器数量
    pub async fn attached(&self) -> usize {
        self.state.lock().await.refs.len()
    }

    pub async fn ref_count(&self, limiter_id: &str) -> usize {
        self.state
            .lock()
            .await
            .refs
            .get(limiter_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimiterError;
    use crate::infra::catalog::ScriptOp;
    use async_trait::async_trait;
    use redis::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingTransport {
        closed: AtomicUsize,
        unsubscribed: AtomicUsize,
        fail_unsubscribe: bool,
    }

    #[async_trait]
    impl StoreTransport for CountingTransport {
        async fn run_script(&self, _: ScriptOp, _: Vec<String>, _: Vec<String>) -> Result<Value> {
            Ok(Value::Nil)
        }
        async fn publish(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _: &str) -> Result<mpsc::UnboundedReceiver<String>> {
            Ok(mpsc::unbounded_channel().1)
        }
        async fn unsubscribe(&self, _: &str) -> Result<()> {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
            if self.fail_unsubscribe {
                return Err(LimiterError::Timeout("Redis command timeout (50ms)".to_string()));
            }
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shared_connection_closes_on_last_detach() {
        let transport = Arc::new(CountingTransport::default());
        let mux = ConnectionMultiplexer::with_transport(transport.clone(), ConnectionMode::Shared);

        mux.attach("a").await.unwrap();
        mux.attach("a").await.unwrap();
        mux.attach("b").await.unwrap();
        assert_eq!(mux.ref_count("a").await, 2);

        mux.detach("a").await.unwrap();
        assert_eq!(transport.unsubscribed.load(Ordering::SeqCst), 0);
        mux.detach("a").await.unwrap();
        assert_eq!(transport.unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 0);

        mux.detach("b").await.unwrap();
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert_eq!(mux.attached().await, 0);

        // 未 attach 的 ID 直接忽略
        mux.detach("unknown").await.unwrap();
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_unsubscribe_still_closes_last_shared_connection() {
        let transport = Arc::new(CountingTransport {
            fail_unsubscribe: true,
            ..Default::default()
        });
        let mux = ConnectionMultiplexer::with_transport(transport.clone(), ConnectionMode::Shared);

        mux.attach("a").await.unwrap();
        let err = mux.detach("a").await.unwrap_err();

        assert!(matches!(err, LimiterError::Timeout(_)));
        assert_eq!(transport.unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert_eq!(mux.attached().await, 0);
    }

    #[tokio::test]
    async fn test_dedicated_connection_always_closes() {
        let transport = Arc::new(CountingTransport::default());
        let mux =
            ConnectionMultiplexer::with_transport(transport.clone(), ConnectionMode::Dedicated);

        mux.attach("a").await.unwrap();
        mux.attach("a").await.unwrap();
        mux.detach("a").await.unwrap();

        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert_eq!(mux.attached().await, 0);
    }
}
