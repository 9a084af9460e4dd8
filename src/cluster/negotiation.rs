//! capacity-priority 协商计时器
//!
//! 每个 counter token 最多一个计时器。有人认领（收到空 target 的消息）时清除；
//! 超时未被认领时执行兜底动作，完成后才移除自身，
//! 因此兜底进行中仍计入 pending，且能被 `cancel_all` 中止。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Timer {
    handle: JoinHandle<()>,
    /// 已超时，兜底动作进行中
    firing: bool,
}

pub struct NegotiationTimers {
    timers: Mutex<HashMap<String, Timer>>,
    timeout: Duration,
}

impl NegotiationTimers {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timers: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 为 counter 启动计时器；已存在时复用，返回 false
    pub fn start<F>(self: &Arc<Self>, counter: &str, on_timeout: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock();
        if timers.contains_key(counter) {
            return false;
        }

        let owner = Arc::clone(self);
        let key = counter.to_string();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            match owner.timers.lock().get_mut(&key) {
                Some(timer) => timer.firing = true,
                None => return,
            }
            on_timeout.await;
            owner.timers.lock().remove(&key);
        });

        timers.insert(
            counter.to_string(),
            Timer {
                handle,
                firing: false,
            },
        );
        true
    }

    /// 协商已完成：取消计时器，返回是否取消了
    ///
    /// 已开始的兜底动作不会被打断。
    pub fn clear(&self, counter: &str) -> bool {
        let mut timers = self.timers.lock();
        match timers.get(counter) {
            Some(timer) if !timer.firing => {
                if let Some(timer) = timers.remove(counter) {
                    timer.handle.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// 取消全部计时器，包括进行中的兜底动作（断开连接时）
    pub fn cancel_all(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.handle.abort();
        }
    }

    pub fn contains(&self, counter: &str) -> bool {
        self.timers.lock().contains_key(counter)
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_and_removes_itself() {
        let timers = NegotiationTimers::new(Duration::from_millis(1000));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        assert!(timers.start("c1", async move {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        // 相同 counter 复用已有计时器
        let f = fired.clone();
        assert!(!timers.start("c1", async move {
            f.fetch_add(10, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.contains("c1"));

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_prevents_fallback() {
        let timers = NegotiationTimers::new(Duration::from_millis(1000));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        timers.start("c1", async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.clear("c1"));
        assert!(!timers.clear("c1"));

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_in_flight_stays_pending_until_cancelled() {
        let timers = NegotiationTimers::new(Duration::from_millis(1000));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        timers.start("c1", async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1001)).await;
        tokio::task::yield_now().await;
        assert_eq!(timers.pending(), 1);
        assert!(timers.contains("c1"));

        timers.cancel_all();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_does_not_interrupt_running_fallback() {
        let timers = NegotiationTimers::new(Duration::from_millis(1000));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        timers.start("c1", async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(1001)).await;
        tokio::task::yield_now().await;
        assert!(!timers.clear("c1"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let timers = NegotiationTimers::new(Duration::from_millis(1000));
        let fired = Arc::new(AtomicUsize::new(0));

        for counter in ["a", "b", "c"] {
            let f = fired.clone();
            timers.start(counter, async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(timers.pending(), 3);

        timers.cancel_all();
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timers.pending(), 0);
    }
}
