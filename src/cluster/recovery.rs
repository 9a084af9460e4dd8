//! 哨兵错误的有界自愈
//!
//! 共享存储可能因 TTL 或重启丢失状态。遇到哨兵错误时执行一次自愈动作，
//! 然后原样重试一次；重试的结果直接返回，不再嵌套。

use std::future::Future;

use crate::error::{LimiterError, Result};
use crate::infra::catalog::ScriptOp;

/// 哨兵错误对应的自愈动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Settings Record 丢失：用本地保存的配置重新 init
    Reinitialize,
    /// Client Record 丢失：用当前排队数重新 register_client
    RegisterClient,
    /// 心跳遇到 Settings Record 丢失：吞掉错误，不做级联恢复
    Ignore,
}

impl Recovery {
    /// 根据操作和错误决定自愈动作，None 表示错误应直接返回
    pub fn plan(op: ScriptOp, err: &LimiterError) -> Option<Self> {
        match err {
            LimiterError::SettingsKeyNotFound if op == ScriptOp::Heartbeat => {
                Some(Recovery::Ignore)
            }
            LimiterError::SettingsKeyNotFound => Some(Recovery::Reinitialize),
            LimiterError::UnknownClient => Some(Recovery::RegisterClient),
            _ => None,
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Recovery::Reinitialize => "init",
            Recovery::RegisterClient => "register_client",
            Recovery::Ignore => "ignore",
        }
    }
}

/// 执行 `attempt`，遇到哨兵错误时先执行 `recover` 再重试一次
///
/// 返回 `Ok(None)` 表示错误被忽略（仅心跳）。
pub async fn run_with_recovery<T, A, AF, R, RF>(
    op: ScriptOp,
    mut attempt: A,
    recover: R,
) -> Result<Option<T>>
where
    A: FnMut() -> AF,
    AF: Future<Output = Result<T>>,
    R: FnOnce(Recovery) -> RF,
    RF: Future<Output = Result<()>>,
{
    let err = match attempt().await {
        Ok(value) => return Ok(Some(value)),
        Err(err) => err,
    };

    match Recovery::plan(op, &err) {
        None => Err(err),
        Some(Recovery::Ignore) => {
            tracing::debug!("{} 忽略错误: {}", op, err);
            Ok(None)
        }
        Some(recovery) => {
            tracing::warn!("♻️ {} 失败（{}），执行 {} 后重试", op, err, recovery.kind());
            crate::infra::metrics::record_recovery(recovery.kind());
            recover(recovery).await?;
            attempt().await.map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn scripted(replies: Vec<Result<u64>>) -> Arc<Mutex<Vec<Result<u64>>>> {
        let mut replies = replies;
        replies.reverse();
        Arc::new(Mutex::new(replies))
    }

    #[tokio::test]
    async fn test_success_skips_recovery() {
        let replies = scripted(vec![Ok(7)]);
        let recovered = Arc::new(Mutex::new(Vec::new()));

        let r = recovered.clone();
        let result = run_with_recovery(
            ScriptOp::Running,
            || {
                let next = replies.lock().pop().unwrap();
                async move { next }
            },
            |recovery| async move {
                r.lock().push(recovery);
                Ok(())
            },
        )
        .await;

        assert_eq!(result.unwrap(), Some(7));
        assert!(recovered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_settings_missing_reinitializes_once() {
        let replies = scripted(vec![
            Err(LimiterError::SettingsKeyNotFound),
            Err(LimiterError::SettingsKeyNotFound),
        ]);
        let recovered = Arc::new(Mutex::new(Vec::new()));

        let r = recovered.clone();
        let result = run_with_recovery(
            ScriptOp::Free,
            || {
                let next = replies.lock().pop().unwrap();
                async move { next }
            },
            |recovery| async move {
                r.lock().push(recovery);
                Ok(())
            },
        )
        .await;

        // 第二次失败直接返回，不再自愈
        assert_eq!(result.unwrap_err(), LimiterError::SettingsKeyNotFound);
        assert_eq!(*recovered.lock(), vec![Recovery::Reinitialize]);
        assert!(replies.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_client_reregisters() {
        let replies = scripted(vec![Err(LimiterError::UnknownClient), Ok(3)]);
        let recovered = Arc::new(Mutex::new(Vec::new()));

        let r = recovered.clone();
        let result = run_with_recovery(
            ScriptOp::Submit,
            || {
                let next = replies.lock().pop().unwrap();
                async move { next }
            },
            |recovery| async move {
                r.lock().push(recovery);
                Ok(())
            },
        )
        .await;

        assert_eq!(result.unwrap(), Some(3));
        assert_eq!(*recovered.lock(), vec![Recovery::RegisterClient]);
    }

    #[tokio::test]
    async fn test_heartbeat_swallows_missing_settings() {
        let result: Result<Option<u64>> = run_with_recovery(
            ScriptOp::Heartbeat,
            || async { Err(LimiterError::SettingsKeyNotFound) },
            |_| async { Err(LimiterError::Internal("heartbeat must not recover".to_string())) },
        )
        .await;

        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let result: Result<Option<u64>> = run_with_recovery(
            ScriptOp::Register,
            || async { Err(LimiterError::Redis("connection reset".to_string())) },
            |_| async { Ok(()) },
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            LimiterError::Redis("connection reset".to_string())
        );
    }
}
