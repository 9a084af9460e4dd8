use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// 超出 highWater 时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 丢弃优先级最低、最旧的任务
    Leak = 1,
    /// 丢弃新提交的任务
    Overflow = 2,
    /// 阻塞：丢弃全部排队任务并在 penalty 时间内拒绝新任务
    Block = 3,
    /// 丢弃优先级更低的任务
    OverflowPriority = 4,
}

impl Strategy {
    /// 数值编码（与脚本约定一致）
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Strategy::Leak),
            2 => Ok(Strategy::Overflow),
            3 => Ok(Strategy::Block),
            4 => Ok(Strategy::OverflowPriority),
            other => Err(LimiterError::Script(format!("unknown strategy code {}", other))),
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Leak
    }
}

/// Settings Record：限流器的规范配置和令牌桶状态
///
/// 所有时间单位为毫秒。`None` 表示该项未启用（例如不限制并发）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// 限流器 ID，多进程共享
    pub id: String,
    /// 同时运行的最大权重
    pub max_concurrent: Option<u64>,
    /// 两个任务之间的最小间隔
    pub min_time: u64,
    /// 本地队列最大深度
    pub high_water: Option<u64>,
    pub strategy: Strategy,
    /// Block 策略下的阻塞时间
    pub penalty: Option<u64>,
    pub reservoir: Option<i64>,
    pub reservoir_refresh_interval: Option<u64>,
    pub reservoir_refresh_amount: Option<i64>,
    pub reservoir_increase_interval: Option<u64>,
    pub reservoir_increase_amount: Option<i64>,
    pub reservoir_increase_maximum: Option<i64>,
    /// 存储格式版本
    pub version: String,
    /// 整组空闲多久后过期
    pub group_timeout: Option<u64>,
    /// 客户端多久未心跳视为下线
    pub client_timeout: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            id: "limiter".to_string(),
            max_concurrent: None,
            min_time: 0,
            high_water: None,
            strategy: Strategy::Leak,
            penalty: None,
            reservoir: None,
            reservoir_refresh_interval: None,
            reservoir_refresh_amount: None,
            reservoir_increase_interval: None,
            reservoir_increase_amount: None,
            reservoir_increase_maximum: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            group_timeout: None,
            client_timeout: 10_000,
        }
    }
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

impl LimiterSettings {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// 展开为脚本参数：字段名与取值交替，未设置的字段为空字符串
    pub fn to_script_args(&self) -> Vec<String> {
        let fields: [(&str, String); 15] = [
            ("maxConcurrent", opt(&self.max_concurrent)),
            ("minTime", self.min_time.to_string()),
            ("highWater", opt(&self.high_water)),
            ("strategy", self.strategy.code().to_string()),
            ("penalty", opt(&self.penalty)),
            ("reservoir", opt(&self.reservoir)),
            ("reservoirRefreshInterval", opt(&self.reservoir_refresh_interval)),
            ("reservoirRefreshAmount", opt(&self.reservoir_refresh_amount)),
            ("reservoirIncreaseInterval", opt(&self.reservoir_increase_interval)),
            ("reservoirIncreaseAmount", opt(&self.reservoir_increase_amount)),
            ("reservoirIncreaseMaximum", opt(&self.reservoir_increase_maximum)),
            ("id", self.id.clone()),
            ("version", self.version.clone()),
            ("groupTimeout", opt(&self.group_timeout)),
            ("clientTimeout", self.client_timeout.to_string()),
        ];

        fields
            .into_iter()
            .flat_map(|(name, value)| [name.to_string(), value])
            .collect()
    }

    /// 应用一组修改，保持本地副本与存储一致
    pub fn apply(&mut self, changes: &[SettingChange]) {
        for change in changes {
            match change {
                SettingChange::MaxConcurrent(v) => self.max_concurrent = *v,
                SettingChange::MinTime(v) => self.min_time = *v,
                SettingChange::HighWater(v) => self.high_water = *v,
                SettingChange::Strategy(v) => self.strategy = *v,
                SettingChange::Penalty(v) => self.penalty = *v,
                SettingChange::Reservoir(v) => self.reservoir = *v,
                SettingChange::ReservoirRefreshInterval(v) => self.reservoir_refresh_interval = *v,
                SettingChange::ReservoirRefreshAmount(v) => self.reservoir_refresh_amount = *v,
                SettingChange::ReservoirIncreaseInterval(v) => {
                    self.reservoir_increase_interval = *v
                }
                SettingChange::ReservoirIncreaseAmount(v) => self.reservoir_increase_amount = *v,
                SettingChange::ReservoirIncreaseMaximum(v) => {
                    self.reservoir_increase_maximum = *v
                }
                SettingChange::GroupTimeout(v) => self.group_timeout = *v,
                SettingChange::ClientTimeout(v) => self.client_timeout = *v,
            }
        }
    }
}

/// 对 Settings Record 的单项修改（update_settings 的参数）
#[derive(Debug, Clone, PartialEq)]
pub enum SettingChange {
    MaxConcurrent(Option<u64>),
    MinTime(u64),
    HighWater(Option<u64>),
    Strategy(Strategy),
    Penalty(Option<u64>),
    Reservoir(Option<i64>),
    ReservoirRefreshInterval(Option<u64>),
    ReservoirRefreshAmount(Option<i64>),
    ReservoirIncreaseInterval(Option<u64>),
    ReservoirIncreaseAmount(Option<i64>),
    ReservoirIncreaseMaximum(Option<i64>),
    GroupTimeout(Option<u64>),
    ClientTimeout(u64),
}

impl SettingChange {
    /// 存储中的字段名
    pub fn field(&self) -> &'static str {
        match self {
            SettingChange::MaxConcurrent(_) => "maxConcurrent",
            SettingChange::MinTime(_) => "minTime",
            SettingChange::HighWater(_) => "highWater",
            SettingChange::Strategy(_) => "strategy",
            SettingChange::Penalty(_) => "penalty",
            SettingChange::Reservoir(_) => "reservoir",
            SettingChange::ReservoirRefreshInterval(_) => "reservoirRefreshInterval",
            SettingChange::ReservoirRefreshAmount(_) => "reservoirRefreshAmount",
            SettingChange::ReservoirIncreaseInterval(_) => "reservoirIncreaseInterval",
            SettingChange::ReservoirIncreaseAmount(_) => "reservoirIncreaseAmount",
            SettingChange::ReservoirIncreaseMaximum(_) => "reservoirIncreaseMaximum",
            SettingChange::GroupTimeout(_) => "groupTimeout",
            SettingChange::ClientTimeout(_) => "clientTimeout",
        }
    }

    pub fn value(&self) -> String {
        match self {
            SettingChange::MaxConcurrent(v)
            | SettingChange::HighWater(v)
            | SettingChange::Penalty(v)
            | SettingChange::ReservoirRefreshInterval(v)
            | SettingChange::ReservoirIncreaseInterval(v)
            | SettingChange::GroupTimeout(v) => opt(v),
            SettingChange::Reservoir(v)
            | SettingChange::ReservoirRefreshAmount(v)
            | SettingChange::ReservoirIncreaseAmount(v)
            | SettingChange::ReservoirIncreaseMaximum(v) => opt(v),
            SettingChange::MinTime(v) | SettingChange::ClientTimeout(v) => v.to_string(),
            SettingChange::Strategy(s) => s.code().to_string(),
        }
    }

    /// 展开一组修改为脚本参数
    pub fn to_script_args(changes: &[SettingChange]) -> Vec<String> {
        changes
            .iter()
            .flat_map(|c| [c.field().to_string(), c.value()])
            .collect()
    }
}
