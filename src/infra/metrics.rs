//! 限流器指标：脚本调用量、自愈次数、心跳失败、协商超时、广播消息
//!
//! 只通过 `metrics` 门面记录，由宿主进程决定安装哪种 Recorder。

/// 指标名称
const COUNTER_SCRIPT_CALLS: &str = "limiter_script_calls_total";
const COUNTER_RECOVERIES: &str = "limiter_recoveries_total";
const COUNTER_HEARTBEAT_FAILURES: &str = "limiter_heartbeat_failures_total";
const COUNTER_NEGOTIATION_TIMEOUTS: &str = "limiter_negotiation_timeouts_total";
const COUNTER_MESSAGES: &str = "limiter_messages_total";

/// 记录一次原子操作调用
pub fn record_script_call(op: &'static str) {
    metrics::counter!(COUNTER_SCRIPT_CALLS, "op" => op).increment(1);
}

/// 记录一次自愈（init / register_client）
pub fn record_recovery(kind: &'static str) {
    metrics::counter!(COUNTER_RECOVERIES, "kind" => kind).increment(1);
}

pub fn record_heartbeat_failure() {
    metrics::counter!(COUNTER_HEARTBEAT_FAILURES).increment(1);
}

/// 协商超时后本地兜底
pub fn record_negotiation_timeout() {
    metrics::counter!(COUNTER_NEGOTIATION_TIMEOUTS).increment(1);
}

/// 记录收到的广播消息（按类型）
pub fn record_message(kind: &'static str) {
    metrics::counter!(COUNTER_MESSAGES, "type" => kind).increment(1);
}
