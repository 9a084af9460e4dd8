use async_trait::async_trait;
use redis::Value;
use tokio::sync::mpsc;

use super::catalog::ScriptOp;
use crate::error::Result;

/// 共享存储的传输层接口
///
/// 只负责执行原子操作、发布和订阅，不关心限流语义。
/// 脚本返回的错误回复必须经过 `LimiterError::from_script_reply` 归类。
#[async_trait]
pub trait StoreTransport: Send + Sync {
    /// 执行一个原子操作
    async fn run_script(&self, op: ScriptOp, keys: Vec<String>, args: Vec<String>)
        -> Result<Value>;

    /// PUBLISH channel message
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// 订阅频道，返回该频道收到的消息
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<String>>;

    /// 取消订阅
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// 关闭物理连接
    async fn close(&self) -> Result<()>;
}
