use anyhow::{bail, Context, Result};
use limiter_cluster::{
    cli::{Cli, Commands},
    config::{self, ClusterConfig},
    logging, ConnectionMode, ConnectionMultiplexer, DistributedStore, EventBus, LimiterEvent,
    ObserverQueue,
};
use std::fs;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // 这两个子命令不需要日志和 Redis
    match &cli.command {
        Commands::GenerateConfig { path } => return generate_config(path),
        Commands::ShowConfig => return show_config(&cli),
        _ => {}
    }

    // 快速读取配置文件的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > 配置文件 > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.as_deref().or(early_log.file.as_deref());

    let _guard = logging::init_logging(&log_level, log_format.as_deref(), log_file, cli.quiet)?;

    let config = ClusterConfig::load(&cli).context("加载配置失败")?;
    if config.limiter.id.is_empty() {
        bail!("需要限流器 ID，请通过 --limiter-id、LIMITER_ID 或配置文件指定");
    }

    tracing::info!("🚦 limiter-cluster 连接限流器 {}", config.limiter.id);
    tracing::info!("  - Redis: {}", config.redis.url);
    tracing::info!("  - Heartbeat: {:?}", config.heartbeat_interval());

    let bus = EventBus::default();
    let queue = Arc::new(ObserverQueue::new(config.limiter.id.clone(), bus.clone()));
    let mode = if config.shared_connection {
        ConnectionMode::Shared
    } else {
        ConnectionMode::Dedicated
    };
    let multiplexer = Arc::new(ConnectionMultiplexer::redis(config.redis.clone(), mode));

    let store = DistributedStore::connect(&config, queue, multiplexer)
        .await
        .context("连接共享存储失败")?;

    let result = run_command(&cli.command, &store, &bus).await;
    store.disconnect().await.context("断开连接失败")?;
    result
}

async fn run_command(command: &Commands, store: &DistributedStore, bus: &EventBus) -> Result<()> {
    match command {
        Commands::Status { json } => {
            let status = store.status().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!("📊 限流器 {}", status.limiter_id);
            println!("  - Running: {}", status.running);
            println!("  - Queued: {}", status.queued);
            println!("  - Done: {}", status.done);
            match status.reservoir {
                Some(reservoir) => println!("  - Reservoir: {}", reservoir),
                None => println!("  - Reservoir: unlimited"),
            }
        }
        Commands::IncrementReservoir { delta } => {
            let reservoir = store.increment_reservoir(*delta).await?;
            println!("✅ Reservoir: {}", reservoir);
        }
        Commands::Broadcast { payload } => {
            store.broadcast_message(payload).await?;
            println!("✅ 已广播");
        }
        Commands::Block { reason } => {
            store.broadcast_blocked(reason).await?;
            println!("⛔ 已广播 blocked");
        }
        Commands::Watch => watch(store, bus).await?,
        Commands::GenerateConfig { .. } | Commands::ShowConfig => {}
    }
    Ok(())
}

/// 打印事件直到 Ctrl-C
async fn watch(store: &DistributedStore, bus: &EventBus) -> Result<()> {
    let mut events = bus.subscribe();
    println!(
        "👀 监听频道 b_{} (client={})，Ctrl-C 退出",
        store.limiter_id(),
        store.client_id()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("👋 退出");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(LimiterEvent::Message(payload)) => println!("📨 message: {}", payload),
                Ok(LimiterEvent::Error(e)) => println!("❌ error: {}", e),
                Ok(LimiterEvent::Debug { description, args }) => {
                    tracing::debug!("{} {:?}", description, args);
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("丢失了 {} 条事件", n),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let config = ClusterConfig::new("my-limiter");
    let content = format!(
        "# limiter-cluster 配置文件\n# 此文件由 limiter-cluster generate-config 生成\n\n{}",
        config.to_toml()?
    );

    fs::write(path, content).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 显示合并后的最终配置
fn show_config(cli: &Cli) -> Result<()> {
    let config = ClusterConfig::load(cli).context("加载配置失败")?;
    println!("{}", config.to_toml()?);
    Ok(())
}
