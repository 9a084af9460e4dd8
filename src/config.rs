use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::model::settings::LimiterSettings;

/// 集群限流器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Settings Record（限流器 ID 及令牌桶参数）
    pub limiter: LimiterSettings,
    /// 本进程的客户端 ID（未指定时随机生成）
    pub client_id: Option<String>,
    /// 心跳间隔（毫秒），None 表示不发送心跳
    pub heartbeat_interval_ms: Option<u64>,
    /// capacity-priority 协商的等待窗口（毫秒）
    pub capacity_priority_timeout_ms: u64,
    /// 首次 init 时是否清空共享存储中的旧状态
    pub clear_datastore: bool,
    /// 是否与同进程内其他限流器共享连接
    pub shared_connection: bool,
    /// Redis 配置
    pub redis: RedisConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterSettings::default(),
            client_id: None,
            heartbeat_interval_ms: Some(5_000),
            capacity_priority_timeout_ms: 1_000,
            clear_datastore: false,
            shared_connection: true,
            redis: RedisConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn new(limiter_id: impl Into<String>) -> Self {
        Self {
            limiter: LimiterSettings::new(limiter_id),
            ..Self::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn capacity_priority_timeout(&self) -> Duration {
        Duration::from_millis(self.capacity_priority_timeout_ms)
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;

        let config: ClusterConfig =
            toml::from_str(&content).with_context(|| "配置文件格式错误")?;

        Ok(config)
    }

    /// 序列化为 TOML（generate-config / show-config 使用）
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("配置序列化失败")
    }

    /// 从环境变量加载配置（LIMITER_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(id) = env::var("LIMITER_ID") {
            self.limiter.id = id;
        }
        if let Ok(redis_url) = env::var("LIMITER_REDIS_URL").or_else(|_| env::var("REDIS_URL")) {
            self.redis.url = redis_url;
        }
        if let Ok(client_id) = env::var("LIMITER_CLIENT_ID") {
            self.client_id = Some(client_id);
        }
        if let Ok(level) = env::var("LIMITER_LOG_LEVEL") {
            self.logging.level = Some(level);
        }
        if let Ok(heartbeat) = env::var("LIMITER_HEARTBEAT_MS") {
            let ms: u64 = heartbeat
                .parse()
                .with_context(|| format!("LIMITER_HEARTBEAT_MS 不是合法的毫秒数: {}", heartbeat))?;
            self.heartbeat_interval_ms = if ms == 0 { None } else { Some(ms) };
        }

        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(redis_url) = &cli.redis_url {
            self.redis.url = redis_url.clone();
        }
        if let Some(limiter_id) = &cli.limiter_id {
            self.limiter.id = limiter_id.clone();
        }
        if let Some(client_id) = &cli.client_id {
            self.client_id = Some(client_id.clone());
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = Some(level);
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            } else {
                tracing::warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::default()
            }
        } else if Path::new("limiter.toml").exists() {
            info!("📄 从默认配置文件加载: limiter.toml");
            Self::from_toml_file("limiter.toml")?
        } else {
            Self::default()
        };

        config.merge_from_env()?;
        config.merge_from_cli(cli);

        Ok(config)
    }
}

/// Redis 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 最小空闲连接数
    pub min_idle: u32,
    /// 连接超时时间（秒）
    pub connection_timeout_secs: u64,
    /// 单条命令超时（毫秒）
    pub command_timeout_ms: u64,
    /// 空闲连接回收时间（秒）
    pub idle_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 10,
            min_idle: 1,
            connection_timeout_secs: 5,
            command_timeout_ms: 2_000,
            idle_timeout_secs: 300,
        }
    }
}

impl RedisConfig {
    /// 获取连接超时时间
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// 日志配置（[logging] 段）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    /// compact / pretty / json
    pub format: Option<String>,
    pub file: Option<String>,
}

/// 只读取配置文件的 [logging] 段，用于在完整加载配置之前初始化日志
pub fn load_early_logging_config(config_file: Option<&str>) -> LoggingConfig {
    #[derive(Deserialize)]
    struct EarlyConfig {
        #[serde(default)]
        logging: LoggingConfig,
    }

    let path = config_file.unwrap_or("limiter.toml");
    fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<EarlyConfig>(&content).ok())
        .map(|early| early.logging)
        .unwrap_or_default()
}
