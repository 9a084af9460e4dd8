//! 广播频道上的消息格式
//!
//! 消息为 `type:payload`，只按固定数量的前导字段切分，
//! payload 本身可以包含冒号。容量字段为空或 `null` 时表示不受限。

use std::fmt;
use std::str::FromStr;

use crate::error::LimiterError;

/// 广播消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastMessage {
    /// `capacity:<amount>`
    Capacity { amount: Option<u64> },
    /// `capacity-priority:<amount>:<target>:<counter>`，target 为空表示先到先得
    CapacityPriority {
        amount: Option<u64>,
        target: Option<String>,
        counter: String,
    },
    /// `message:<payload>`
    Message(String),
    /// `blocked:<payload>`
    Blocked(String),
}

impl BroadcastMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastMessage::Capacity { .. } => "capacity",
            BroadcastMessage::CapacityPriority { .. } => "capacity-priority",
            BroadcastMessage::Message(_) => "message",
            BroadcastMessage::Blocked(_) => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, LimiterError> {
        let (kind, payload) = raw.split_once(':').unwrap_or((raw, ""));

        match kind {
            "capacity" => Ok(BroadcastMessage::Capacity {
                amount: parse_amount(payload)?,
            }),
            "capacity-priority" => {
                let mut fields = payload.splitn(3, ':');
                let amount = fields.next().unwrap_or_default();
                let (target, counter) = match (fields.next(), fields.next()) {
                    (Some(target), Some(counter)) => (target, counter),
                    _ => {
                        return Err(LimiterError::Protocol(format!(
                            "capacity-priority needs amount, target and counter: {:?}",
                            raw
                        )))
                    }
                };

                Ok(BroadcastMessage::CapacityPriority {
                    amount: parse_amount(amount)?,
                    target: Some(target.to_string()).filter(|t| !t.is_empty()),
                    counter: counter.to_string(),
                })
            }
            "message" => Ok(BroadcastMessage::Message(payload.to_string())),
            "blocked" => Ok(BroadcastMessage::Blocked(payload.to_string())),
            other => Err(LimiterError::Protocol(format!(
                "unknown message type {:?}",
                other
            ))),
        }
    }
}

fn parse_amount(field: &str) -> Result<Option<u64>, LimiterError> {
    let field = field.trim();
    if field.is_empty() || field == "null" {
        return Ok(None);
    }
    if let Ok(amount) = field.parse::<u64>() {
        return Ok(Some(amount));
    }
    // 浮点数截断，负数按 0 处理
    field
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(|n| Some(n.max(0.0).trunc() as u64))
        .ok_or_else(|| LimiterError::Protocol(format!("invalid capacity {:?}", field)))
}

fn render_amount(amount: &Option<u64>) -> String {
    amount.map(|a| a.to_string()).unwrap_or_default()
}

impl FromStr for BroadcastMessage {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BroadcastMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastMessage::Capacity { amount } => {
                write!(f, "capacity:{}", render_amount(amount))
            }
            BroadcastMessage::CapacityPriority {
                amount,
                target,
                counter,
            } => write!(
                f,
                "capacity-priority:{}:{}:{}",
                render_amount(amount),
                target.as_deref().unwrap_or(""),
                counter
            ),
            BroadcastMessage::Message(payload) => write!(f, "message:{}", payload),
            BroadcastMessage::Blocked(payload) => write!(f, "blocked:{}", payload),
        }
    }
}
