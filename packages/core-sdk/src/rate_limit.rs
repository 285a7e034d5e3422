use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;

/** \brief 无法识别客户端地址时使用的键。 */
pub const UNKNOWN_CLIENT: &str = "unknown";

/**
 * \brief 进程级固定窗口计数器，按客户端地址计数，定时整体清空。
 */
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32) -> Self {
        Self {
            max_requests,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /**
     * \brief 计数加一；超过上限后返回 false。
     */
    pub fn allow(&self, client_key: &str) -> bool {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(client_key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count <= self.max_requests
    }

    pub fn reset(&self) {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn count(&self, client_key: &str) -> u32 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_key)
            .copied()
            .unwrap_or(0)
    }

    /**
     * \brief 启动后台定时器，每个周期无条件清空计数；限流器释放后任务自动退出。
     */
    pub fn spawn_reset_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // interval 的第一次 tick 立即完成
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(limiter) => limiter.reset(),
                    None => break,
                }
            }
        })
    }
}

/**
 * \brief 从转发地址头推导客户端键：逗号列表取第二项（索引 1），否则取原值，缺失时为 `unknown`。
 */
pub fn client_key(forwarded_for: Option<&str>) -> String {
    match forwarded_for {
        Some(raw) if raw.contains(',') => raw
            .split(',')
            .nth(1)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        Some(raw) if !raw.is_empty() => raw.to_string(),
        _ => UNKNOWN_CLIENT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_ceiling_then_blocks() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert!(!limiter.allow("10.0.0.1"));
        assert!(limiter.allow("10.0.0.2"));
    }

    #[test]
    fn test_reset_reopens_window() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        limiter.reset();
        assert_eq!(limiter.count("a"), 0);
        assert!(limiter.allow("a"));
    }

    #[test]
    fn test_client_key_derivation() {
        assert_eq!(client_key(Some("1.1.1.1, 2.2.2.2, 3.3.3.3")), "2.2.2.2");
        assert_eq!(client_key(Some("9.9.9.9")), "9.9.9.9");
        assert_eq!(client_key(Some("")), UNKNOWN_CLIENT);
        assert_eq!(client_key(None), UNKNOWN_CLIENT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reset() {
        let limiter = Arc::new(RateLimiter::new(1));
        let handle = limiter.spawn_reset_task(Duration::from_secs(60));
        assert!(limiter.allow("x"));
        assert!(!limiter.allow("x"));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(limiter.allow("x"));
        drop(limiter);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.is_finished());
    }
}
