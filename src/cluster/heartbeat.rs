use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// 心跳任务
///
/// 每个 tick 串行执行，上一个 tick 未完成时不会开始下一个。
/// tick 内部的失败由调用方自行上报，不会中断循环。drop 即取消。
pub struct Heartbeat {
    handle: JoinHandle<()>,
    interval: Duration,
}

impl Heartbeat {
    pub fn spawn<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick().await;
            }
        });

        tracing::debug!("💓 心跳已启动，间隔 {}ms", interval.as_millis());
        Self { handle, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
