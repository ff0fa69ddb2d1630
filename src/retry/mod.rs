//! 重试控制
//!
//! 对远端写入做有界的指数退避重试。错误按可恢复性分类：
//!
//! - `InvalidArgument` → 升级清洗强度后重试（清洗由调用方按轮次完成）
//! - `Unavailable` / `Conflict` → 原样重试（Conflict 重读后重放）
//! - `PermissionDenied` / `NotFound` → 终态，立即向上传播
//!
//! 退避 `min(base × 2^(attempt-1), cap)`，默认 `min(1000·2^(n-1), 10000)`
//! 毫秒。不加抖动；上限的意义是给用户可感的发送操作一个最坏时延界。
//! 退避通过异步 sleep 实现，不阻塞线程。

use crate::error::{ConvoError, StoreError};
use std::time::Duration;

/// 重试策略参数
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最多发起的调用次数（含首次），默认 3
    pub max_retries: u32,
    /// 首次退避等待（毫秒），默认 1000
    pub base_delay_ms: u64,
    /// 退避上限（毫秒），默认 10_000
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的退避时长（attempt 从 1 起计）
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(10);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// 单次失败后的重试决策
#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    /// 等待 `delay` 后发起下一次尝试
    Retry { delay: Duration },
    /// 终态或重试耗尽，错误向上传播（由调用方降级到本地缓存）
    Stop,
}

/// 重试控制器：只负责分类与决策，调用循环由使用方持有
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 第 `attempt` 次调用（1 起计）失败后的决策
    pub fn decide(&self, attempt: u32, err: &ConvoError) -> RetryDecision {
        if attempt >= self.policy.max_retries {
            return RetryDecision::Stop;
        }
        match err.as_store_error() {
            Some(
                StoreError::InvalidArgument(_)
                | StoreError::Unavailable(_)
                | StoreError::Conflict { .. },
            ) => RetryDecision::Retry {
                delay: self.policy.backoff_delay(attempt),
            },
            _ => RetryDecision::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable() -> ConvoError {
        StoreError::Unavailable("网络抖动".to_string()).into()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(8_000));
        // 上限兜底，避免用户等待无界增长
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(10_000));
        assert_eq!(policy.backoff_delay(30), Duration::from_millis(10_000));
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let retrier = Retrier::new(RetryPolicy::default());
        assert!(matches!(
            retrier.decide(1, &unavailable()),
            RetryDecision::Retry { .. }
        ));
        let conflict: ConvoError = StoreError::Conflict { expected: 1, actual: 2 }.into();
        assert!(matches!(
            retrier.decide(1, &conflict),
            RetryDecision::Retry { .. }
        ));
        let invalid: ConvoError = StoreError::InvalidArgument("bad".to_string()).into();
        assert!(matches!(
            retrier.decide(2, &invalid),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_terminal_errors_never_retried() {
        let retrier = Retrier::new(RetryPolicy::default());
        let denied: ConvoError = StoreError::PermissionDenied("别人的会话".to_string()).into();
        assert_eq!(retrier.decide(1, &denied), RetryDecision::Stop);
        let missing: ConvoError = StoreError::NotFound("conv_x".to_string()).into();
        assert_eq!(retrier.decide(1, &missing), RetryDecision::Stop);
    }

    #[test]
    fn test_ceiling_stops_retries() {
        let retrier = Retrier::new(RetryPolicy::default());
        assert!(matches!(
            retrier.decide(2, &unavailable()),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(retrier.decide(3, &unavailable()), RetryDecision::Stop);
    }

    #[test]
    fn test_non_store_errors_stop() {
        let retrier = Retrier::new(RetryPolicy::default());
        let other = ConvoError::Other("无关错误".to_string());
        assert_eq!(retrier.decide(1, &other), RetryDecision::Stop);
    }
}
