//! 原子操作返回值的类型化表示

use redis::Value;
use serde::{Deserialize, Serialize};

use super::settings::Strategy;
use crate::error::{LimiterError, Result};

/// register 的返回值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    /// 是否已被接纳
    pub success: bool,
    /// 距离可执行还需等待的毫秒数
    pub wait: Option<u64>,
    /// 接纳后剩余的 reservoir（未启用时为 None）
    pub reservoir: Option<i64>,
}

/// submit 的返回值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReply {
    pub reached_high_water: bool,
    pub blocked: bool,
    pub strategy: Strategy,
}

/// free 的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeReply {
    /// 释放后仍在运行的总权重
    pub running: u64,
}

/// 限流器共享状态的快照，供 `status` 输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStatus {
    pub limiter_id: String,
    pub client_id: String,
    pub running: u64,
    pub queued: u64,
    pub done: u64,
    /// 未启用 reservoir 时为 None
    pub reservoir: Option<i64>,
}

/// 把单个回复值解析为整数；Nil 视为未设置
pub fn as_opt_i64(value: &Value) -> Result<Option<i64>> {
    match value {
        Value::Nil => Ok(None),
        Value::Int(n) => Ok(Some(*n)),
        Value::Double(n) => Ok(Some(*n as i64)),
        Value::BulkString(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<f64>()
                .map(|n| Some(n as i64))
                .map_err(|_| unexpected("number", value))
        }
        Value::SimpleString(text) => text
            .parse::<f64>()
            .map(|n| Some(n as i64))
            .map_err(|_| unexpected("number", value)),
        Value::Okay => Ok(None),
        other => Err(unexpected("number", other)),
    }
}

pub fn as_i64(value: &Value) -> Result<i64> {
    as_opt_i64(value)?.ok_or_else(|| unexpected("number", value))
}

pub fn as_u64(value: &Value) -> Result<u64> {
    Ok(as_i64(value)?.max(0) as u64)
}

/// 脚本中的 true/false 以 1/Nil 返回
pub fn as_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Nil => Ok(false),
        Value::Boolean(b) => Ok(*b),
        other => Ok(as_i64(other)? != 0),
    }
}

fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a [Value]> {
    match value {
        Value::Array(items) => Ok(items.as_slice()),
        other => Err(unexpected(what, other)),
    }
}

fn unexpected(what: &str, value: &Value) -> LimiterError {
    LimiterError::Script(format!("unexpected reply for {}: {:?}", what, value))
}

impl RegisterReply {
    /// `[success, wait, reservoir]`，失败时只有 `[0]`
    pub fn from_value(value: &Value) -> Result<Self> {
        let items = as_array(value, "register")?;
        let success = items.first().map(as_bool).transpose()?.unwrap_or(false);
        let wait = items.get(1).map(as_opt_i64).transpose()?.flatten();
        let reservoir = items.get(2).map(as_opt_i64).transpose()?.flatten();

        Ok(Self {
            success,
            wait: wait.map(|w| w.max(0) as u64),
            reservoir,
        })
    }
}

impl SubmitReply {
    /// `[reachedHighWater, blocked, strategy]`
    pub fn from_value(value: &Value) -> Result<Self> {
        let items = as_array(value, "submit")?;
        if items.len() < 3 {
            return Err(unexpected("submit", value));
        }

        Ok(Self {
            reached_high_water: as_bool(&items[0])?,
            blocked: as_bool(&items[1])?,
            strategy: Strategy::from_code(as_i64(&items[2])?)?,
        })
    }
}

impl FreeReply {
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(Self {
            running: as_u64(value)?,
        })
    }
}
