use std::{future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;
use crate::telemetry;

/**
 * \brief 指数退避参数。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /** \brief 最大重试次数（总尝试次数为 max_retries + 1） */
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /** \brief 随机抖动上限（不含） */
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /**
     * \brief 第 attempt 次失败后的基础等待：min(base * 2^attempt, max)，不含抖动。
     */
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

/**
 * \brief 以指数退避重试整个操作。
 * \details 尝试下标从 0 开始；失败时若已达 max_retries 或 retry_condition 返回 false，
 *          原样返回该错误。等待期间若被取消，同样返回最近一次错误，不再发起新尝试。
 * \param operation 以当前尝试下标调用
 * \param on_retry  (attempt, delay, error)，在等待前调用
 */
pub async fn retry_with_backoff<T, E, Op, Fut, C, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: Op,
    retry_condition: C,
    mut on_retry: R,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    R: FnMut(u32, Duration, &E),
{
    let mut attempt = 0u32;
    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= policy.max_retries || !retry_condition(&err) {
            return Err(err);
        }
        let delay = policy.backoff_delay(attempt) + policy.jitter();
        on_retry(attempt, delay, &err);
        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/**
 * \brief 默认重试判定：瞬时 Provider 错误，或全部凭据都因连接失败（离线）。
 * \details 其余聚合失败不重试：轮询已经在被包装的调用内部发生过。
 */
pub fn is_retryable(err: &GenerationError) -> bool {
    match err {
        GenerationError::Provider(e) => e.is_transient(),
        GenerationError::AllKeysFailed { .. } => err.is_offline_exhaustion(),
        GenerationError::NoKeysConfigured | GenerationError::Cancelled => false,
    }
}

/**
 * \brief 默认的 on_retry 回调：写入遥测日志。
 */
pub fn log_retry(category: &'static str) -> impl FnMut(u32, Duration, &GenerationError) {
    move |attempt: u32, delay: Duration, err: &GenerationError| {
        telemetry::log_warn(
            category,
            &format!(
                "attempt {} failed ({}); retrying in {} ms",
                attempt + 1,
                err,
                delay.as_millis()
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KeyFailure, ProviderError, ProviderErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(10_000));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_below_bound() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            assert!(policy.jitter() < Duration::from_millis(1000));
        }
        assert_eq!(no_jitter().jitter(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_false_attempts_once() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let mut retries = 0;
        let result: Result<(), ProviderError> = retry_with_backoff(
            &RetryPolicy::default(),
            &cancel,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::from_status(503, "first failure")) }
            },
            |_| false,
            |_, _, _| retries += 1,
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.message, "first failure");
        assert_eq!(err.status, Some(503));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let policy = RetryPolicy {
            max_retries: 2,
            ..no_jitter()
        };
        let started = tokio::time::Instant::now();
        let result = retry_with_backoff(
            &policy,
            &cancel,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(ProviderError::new(ProviderErrorKind::Network, "offline"))
                    } else {
                        Ok("done")
                    }
                }
            },
            |e: &ProviderError| e.is_transient(),
            |attempt, delay, _| seen.push((attempt, delay)),
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            seen,
            vec![
                (0, Duration::from_millis(1000)),
                (1, Duration::from_millis(2000))
            ]
        );
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), ProviderError> = retry_with_backoff(
            &no_jitter(),
            &cancel,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::from_status(429, "busy")) }
            },
            |e: &ProviderError| e.is_transient(),
            |_, _, _| {},
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ProviderErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_retrying() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), ProviderError> = retry_with_backoff(
            &RetryPolicy::default(),
            &cancel,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::from_status(500, "boom")) }
            },
            |_| true,
            |_, _, _| cancel.cancel(),
        )
        .await;
        assert_eq!(result.unwrap_err().message, "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_condition() {
        assert!(is_retryable(&GenerationError::Provider(
            ProviderError::from_status(502, "bad gateway")
        )));
        assert!(is_retryable(&GenerationError::Provider(ProviderError::new(
            ProviderErrorKind::Timeout,
            "timed out"
        ))));
        assert!(!is_retryable(&GenerationError::Provider(
            ProviderError::from_status(400, "bad request")
        )));
        assert!(!is_retryable(&GenerationError::NoKeysConfigured));
        assert!(!is_retryable(&GenerationError::Cancelled));

        let auth = GenerationError::AllKeysFailed {
            attempts: 1,
            failures: vec![KeyFailure {
                key_index: 0,
                name: "k".into(),
                error: ProviderError::from_status(401, "bad key"),
            }],
        };
        assert!(!is_retryable(&auth));

        let offline = GenerationError::AllKeysFailed {
            attempts: 1,
            failures: vec![KeyFailure {
                key_index: 0,
                name: "k".into(),
                error: ProviderError::new(ProviderErrorKind::Network, "connect refused"),
            }],
        };
        assert!(is_retryable(&offline));
    }
}
