use clap::{Parser, Subcommand};

impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// limiter-cluster - 基于 Redis 的集群限流协调工具
#[derive(Parser, Debug)]
#[command(name = "limiter-cluster")]
#[command(version)]
#[command(about = "查看和操作跨进程共享的限流器状态", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", help = "指定配置文件路径")]
    pub config_file: Option<String>,

    /// Redis 连接 URL
    #[arg(long, value_name = "URL", help = "Redis 连接字符串")]
    pub redis_url: Option<String>,

    /// 限流器 ID
    #[arg(long, value_name = "ID", help = "限流器 ID（决定 key 前缀和广播频道）")]
    pub limiter_id: Option<String>,

    /// 客户端 ID
    #[arg(long, value_name = "ID", help = "本进程的客户端 ID（默认随机生成）")]
    pub client_id: Option<String>,

    /// 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error"
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", help = "日志格式: pretty, json, compact")]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, value_name = "PATH", help = "日志输出文件路径")]
    pub log_file: Option<String>,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, action = clap::ArgAction::Count, help = "详细输出级别")]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', help = "静默模式（不输出日志）")]
    pub quiet: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 生成默认配置文件
    GenerateConfig {
        /// 输出文件路径
        #[arg(value_name = "PATH", default_value = "limiter.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置）
    ShowConfig,
    /// 显示限流器的共享状态
    Status {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 增减 reservoir
    IncrementReservoir {
        /// 增量（可为负数）
        #[arg(value_name = "DELTA", allow_hyphen_values = true)]
        delta: i64,
    },
    /// 向所有进程广播一条消息
    Broadcast {
        /// 消息内容
        #[arg(value_name = "PAYLOAD")]
        payload: String,
    },
    /// 广播 blocked，让所有进程丢弃排队任务
    Block {
        /// 附带的说明
        #[arg(value_name = "REASON", default_value = "")]
        reason: String,
    },
    /// 持续打印广播频道上的事件，Ctrl-C 退出
    Watch,
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        self.log_format.clone()
    }
}
