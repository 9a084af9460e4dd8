use thiserror::Error;

/// 原子操作返回的哨兵错误：限流器配置已过期/被驱逐
pub const SETTINGS_KEY_NOT_FOUND: &str = "SETTINGS_KEY_NOT_FOUND";
/// 原子操作返回的哨兵错误：本进程的客户端记录不存在
pub const UNKNOWN_CLIENT: &str = "UNKNOWN_CLIENT";
/// submit 拒绝超重任务时的前缀（OVERWEIGHT:<weight>:<maxConcurrent>）
pub const OVERWEIGHT_PREFIX: &str = "OVERWEIGHT";

/// 限流器错误类型
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// 共享存储中的 Settings Record 不存在（TTL 过期或存储重启）
    #[error("{}", SETTINGS_KEY_NOT_FOUND)]
    SettingsKeyNotFound,
    /// 共享存储中没有本进程的 Client Record
    #[error("{}", UNKNOWN_CLIENT)]
    UnknownClient,
    /// 任务权重超过 maxConcurrent
    #[error("Impossible to add a job having a weight of {weight} to a limiter having a maxConcurrent setting of {max_concurrent}")]
    Overweight { weight: u64, max_concurrent: u64 },
    /// 其他脚本错误
    #[error("Script error: {0}")]
    Script(String),
    /// Redis 传输错误
    #[error("Redis error: {0}")]
    Redis(String),
    /// 广播消息无法解析
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),
    /// 启动流程失败，适配器不可用
    #[error("Limiter not ready: {0}")]
    NotReady(String),
    /// 适配器已断开
    #[error("Limiter has been disconnected")]
    Disconnected,
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LimiterError {
    /// 把脚本返回的错误字符串归类为具体错误
    pub fn from_script_reply(message: &str) -> Self {
        let message = message.trim();
        match message {
            SETTINGS_KEY_NOT_FOUND => return LimiterError::SettingsKeyNotFound,
            UNKNOWN_CLIENT => return LimiterError::UnknownClient,
            _ => {}
        }

        let mut parts = message.splitn(3, ':');
        if parts.next() == Some(OVERWEIGHT_PREFIX) {
            let weight = parts.next().and_then(|w| w.trim().parse().ok());
            let max_concurrent = parts.next().and_then(|m| m.trim().parse().ok());
            if let (Some(weight), Some(max_concurrent)) = (weight, max_concurrent) {
                return LimiterError::Overweight {
                    weight,
                    max_concurrent,
                };
            }
        }

        LimiterError::Script(message.to_string())
    }

    /// 是否为可本地自愈的哨兵错误
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            LimiterError::SettingsKeyNotFound | LimiterError::UnknownClient
        )
    }
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        // 脚本中的 redis.error_reply 以未知错误码的形式返回
        if err.kind() == redis::ErrorKind::ExtensionError {
            let reply = match (err.code(), err.detail()) {
                (Some(code), Some(detail)) => format!("{} {}", code, detail),
                (Some(code), None) => code.to_string(),
                _ => err.to_string(),
            };
            return LimiterError::from_script_reply(&reply);
        }
        LimiterError::Redis(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for LimiterError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        LimiterError::Timeout(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_classified() {
        assert_eq!(
            LimiterError::from_script_reply("SETTINGS_KEY_NOT_FOUND"),
            LimiterError::SettingsKeyNotFound
        );
        assert_eq!(
            LimiterError::from_script_reply("UNKNOWN_CLIENT"),
            LimiterError::UnknownClient
        );
        assert!(LimiterError::UnknownClient.is_sentinel());
    }

    #[test]
    fn test_overweight_message() {
        let err = LimiterError::from_script_reply("OVERWEIGHT:5:1");
        assert_eq!(
            err,
            LimiterError::Overweight {
                weight: 5,
                max_concurrent: 1
            }
        );
        assert_eq!(
            err.to_string(),
            "Impossible to add a job having a weight of 5 to a limiter having a maxConcurrent setting of 1"
        );
        assert!(!err.is_sentinel());
    }

    #[test]
    fn test_other_replies_stay_opaque() {
        assert_eq!(
            LimiterError::from_script_reply("OVERWEIGHT:abc"),
            LimiterError::Script("OVERWEIGHT:abc".to_string())
        );
        assert_eq!(
            LimiterError::from_script_reply("ERR something broke"),
            LimiterError::Script("ERR something broke".to_string())
        );
    }
}
