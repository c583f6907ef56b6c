//! 重试策略
//!
//! 可组合的执行器：给定操作、可重试判定、最大尝试次数与指数退避，返回操作结果或在耗尽后返回最后一次错误。
//! 退避：base_delay * multiplier^(n-1)，上限 max_delay（默认 2s、4s、8s、10s…）。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::LlmSection;

/// 指数退避重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 含首次调用在内的最大尝试次数
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// 由 [llm] 段构造单后端重试策略
    pub fn from_config(section: &LlmSection) -> Self {
        Self::new(
            section.max_call_retries,
            Duration::from_millis(section.retry_base_delay_ms),
            Duration::from_millis(section.retry_max_delay_ms),
        )
    }

    /// 不等待的策略（测试与本地 Mock 使用）
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// 第 attempt 次失败后的等待时长（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_ms = self.base_delay.as_millis() as f64 * factor;
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// 本策略下全部尝试之间的等待序列（长度 max_attempts - 1）
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.delay_for(n)).collect()
    }

    /// 执行 op；仅当 is_retryable 为真且仍有预算时等待后重试，否则立即返回错误
    pub async fn execute<T, E, F, Fut, P>(&self, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying_after_error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_progression_capped() {
        let policy = RetryPolicy::new(6, Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn test_schedule_non_decreasing_and_capped() {
        let policy = RetryPolicy::new(8, Duration::from_secs(2), Duration::from_secs(10));
        let schedule = policy.schedule();
        assert_eq!(schedule.len(), 7);
        assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
        assert!(schedule.iter().all(|d| *d <= Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_sleeps_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(10));
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = tokio::time::Instant::now();

        let result: Result<(), String> = policy
            .execute(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("rate limited".to_string())
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s + 4s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_execute_non_retryable_returns_immediately() {
        let policy = RetryPolicy::immediate(5);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), String> = policy
            .execute(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("unauthorized".to_string())
                },
                |e| e != "unauthorized",
            )
            .await;

        assert_eq!(result, Err("unauthorized".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_recovers_after_transient_failure() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<u32, String> = policy
            .execute(
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 2 {
                        Err("timeout".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(2));
    }
}
