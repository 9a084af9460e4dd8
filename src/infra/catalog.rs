//! 原子操作目录
//!
//! 每个操作对应 lua/ 下的一个脚本，执行时前置 lib.lua 公共部分。
//! 所有操作都作用于以限流器 ID 为前缀的同一组 key 上。

use std::fmt;

include!(concat!(env!("OUT_DIR"), "/scripts.rs"));

/// 原子操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptOp {
    Init,
    RegisterClient,
    Heartbeat,
    Register,
    Submit,
    Free,
    Done,
    Running,
    Queued,
    GroupCheck,
    IncrementReservoir,
    CurrentReservoir,
    Check,
    UpdateSettings,
    BlacklistClient,
}

impl ScriptOp {
    pub const ALL: [ScriptOp; 15] = [
        ScriptOp::Init,
        ScriptOp::RegisterClient,
        ScriptOp::Heartbeat,
        ScriptOp::Register,
        ScriptOp::Submit,
        ScriptOp::Free,
        ScriptOp::Done,
        ScriptOp::Running,
        ScriptOp::Queued,
        ScriptOp::GroupCheck,
        ScriptOp::IncrementReservoir,
        ScriptOp::CurrentReservoir,
        ScriptOp::Check,
        ScriptOp::UpdateSettings,
        ScriptOp::BlacklistClient,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ScriptOp::Init => "init",
            ScriptOp::RegisterClient => "register_client",
            ScriptOp::Heartbeat => "heartbeat",
            ScriptOp::Register => "register",
            ScriptOp::Submit => "submit",
            ScriptOp::Free => "free",
            ScriptOp::Done => "done",
            ScriptOp::Running => "running",
            ScriptOp::Queued => "queued",
            ScriptOp::GroupCheck => "group_check",
            ScriptOp::IncrementReservoir => "increment_reservoir",
            ScriptOp::CurrentReservoir => "current_reservoir",
            ScriptOp::Check => "check",
            ScriptOp::UpdateSettings => "update_settings",
            ScriptOp::BlacklistClient => "blacklist_client",
        }
    }

    /// 启动阶段的操作，不需要等待适配器就绪
    pub fn is_bootstrap(self) -> bool {
        matches!(self, ScriptOp::Init | ScriptOp::RegisterClient)
    }

    /// 脚本全文（lib 前缀 + 操作本体）
    pub fn source(self) -> Option<String> {
        let body = script_body(self.name())?;
        Some(format!("{}\n{}", LIB_PRELUDE, body))
    }
}

impl fmt::Display for ScriptOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn script_body(name: &str) -> Option<&'static str> {
    SCRIPTS
        .iter()
        .find(|(script, _)| *script == name)
        .map(|(_, body)| *body)
}

/// 限流器在共享存储中的 key 集合（顺序与脚本中的 KEYS 一致）
pub fn keys(limiter_id: &str) -> Vec<String> {
    [
        "settings",
        "job_weights",
        "job_expirations",
        "job_clients",
        "client_running",
        "client_num_queued",
        "client_last_registered",
        "client_last_seen",
    ]
    .iter()
    .map(|suffix| format!("b_{}_{}", limiter_id, suffix))
    .collect()
}

/// 限流器的广播频道名
pub fn channel(limiter_id: &str) -> String {
    format!("b_{}", limiter_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_op_has_a_script() {
        for op in ScriptOp::ALL {
            let source = op.source();
            assert!(source.is_some(), "missing script for {}", op);
            assert!(source.unwrap().contains("settings_key"));
        }
    }

    #[test]
    fn test_embedded_scripts_match_ops() {
        assert!(!LIB_PRELUDE.trim().is_empty());
        assert!(SCRIPTS.iter().all(|(name, _)| *name != "lib"));
        assert!(SCRIPTS.iter().all(|(_, body)| !body.trim().is_empty()));

        let mut names: Vec<&str> = SCRIPTS.iter().map(|(name, _)| *name).collect();
        let mut ops: Vec<&str> = ScriptOp::ALL.iter().map(|op| op.name()).collect();
        names.sort_unstable();
        ops.sort_unstable();
        assert_eq!(names, ops);

        let source = ScriptOp::Done.source().unwrap();
        assert!(source.starts_with(LIB_PRELUDE));
    }

    #[test]
    fn test_keys_are_scoped_by_limiter_id() {
        let keys = keys("orders");
        assert_eq!(keys.len(), 8);
        assert_eq!(keys[0], "b_orders_settings");
        assert_eq!(keys[7], "b_orders_client_last_seen");
        assert_eq!(channel("orders"), "b_orders");
    }

    #[test]
    fn test_bootstrap_ops() {
        assert!(ScriptOp::Init.is_bootstrap());
        assert!(ScriptOp::RegisterClient.is_bootstrap());
        assert!(!ScriptOp::Heartbeat.is_bootstrap());
        assert_eq!(ScriptOp::BlacklistClient.to_string(), "blacklist_client");
    }
}
