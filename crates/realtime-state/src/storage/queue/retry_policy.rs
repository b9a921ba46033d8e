use crate::config::StateManagerConfig;
use crate::error::RealtimeStateError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 5xx 可重试
    ServerError(u16),
    /// 限流 - 延迟重试
    RateLimited,
    /// 被服务端拒绝（4xx）- 不重试
    Rejected(u16),
    /// 校验失败 - 不重试
    Validation,
    /// 目标不存在 - 不重试
    NotFound,
    /// 数据无法解析 - 不重试
    InvalidData,
    /// 被取消
    Cancelled,
    /// 未知错误
    Unknown(String),
}

impl FailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::NetworkTimeout => true,
            FailureReason::NetworkUnavailable => true,
            FailureReason::ServerError(code) => *code >= 500 && *code < 600,
            FailureReason::RateLimited => true,
            FailureReason::Rejected(_) => false,
            FailureReason::Validation => false,
            FailureReason::NotFound => false,
            FailureReason::InvalidData => false,
            FailureReason::Cancelled => false,
            FailureReason::Unknown(_) => true, // 保守策略：未知错误可重试
        }
    }

    /// 获取重试延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            FailureReason::NetworkUnavailable => 2.0,
            FailureReason::ServerError(_) => 1.5,
            FailureReason::RateLimited => 3.0, // 限流需要更长延迟
            _ => 1.0,
        }
    }
}

impl From<&RealtimeStateError> for FailureReason {
    fn from(error: &RealtimeStateError) -> Self {
        match error {
            RealtimeStateError::Timeout(_) => FailureReason::NetworkTimeout,
            RealtimeStateError::NotConnected => FailureReason::NetworkUnavailable,
            RealtimeStateError::Transport(msg) => {
                if msg.contains("timeout") {
                    FailureReason::NetworkTimeout
                } else {
                    FailureReason::NetworkUnavailable
                }
            }
            RealtimeStateError::Server { status, .. } => FailureReason::ServerError(*status),
            RealtimeStateError::Rejected { status: 429, .. } => FailureReason::RateLimited,
            RealtimeStateError::Rejected { status, .. } => FailureReason::Rejected(*status),
            RealtimeStateError::Conflict(_) => FailureReason::Rejected(409),
            RealtimeStateError::Validation(_) | RealtimeStateError::InvalidArgument(_) => {
                FailureReason::Validation
            }
            RealtimeStateError::NotFound(_) => FailureReason::NotFound,
            RealtimeStateError::Serialization(_) => FailureReason::InvalidData,
            RealtimeStateError::Cancelled(_) => FailureReason::Cancelled,
            other => FailureReason::Unknown(other.to_string()),
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 单个操作最多尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &StateManagerConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            base_delay_ms: config.retry.base_delay_ms,
            max_delay_ms: config.retry.max_delay_ms,
            backoff_factor: config.retry.backoff_factor,
            jitter_factor: config.retry.jitter_factor,
        }
    }

    /// 检查是否应该重试；`attempts` 为已经失败的次数
    pub fn should_retry(&self, attempts: u32, reason: &FailureReason) -> bool {
        attempts < self.max_attempts && reason.is_retryable()
    }

    /// 计算下一次重试前的等待时间
    ///
    /// 延迟 = base_delay * backoff_factor^(attempts-1) * 原因倍数，上限 max_delay，再叠加抖动。
    pub fn next_delay(&self, attempts: u32, reason: &FailureReason) -> Option<Duration> {
        if !self.should_retry(attempts, reason) {
            return None;
        }

        let exponent = attempts.saturating_sub(1) as f64;
        let base_delay = self.base_delay_ms as f64 * self.backoff_factor.powf(exponent);
        let capped_delay = (base_delay * reason.delay_multiplier()).min(self.max_delay_ms as f64);

        let jitter = capped_delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped_delay + jitter).max(0.0);

        Some(Duration::from_millis(final_delay as u64))
    }
}

/// 重试决策
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 等待后重试
    RetryAfter(Duration),
    /// 放弃（重试耗尽或永久失败）
    GiveUp,
}

/// 重试状态管理器
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 处理一次失败，`attempts` 为包含本次在内的失败次数
    pub fn handle_failure(&self, attempts: u32, reason: &FailureReason) -> RetryDecision {
        match self.policy.next_delay(attempts, reason) {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::GiveUp,
        }
    }

    /// 检查重试时间（UTC 毫秒）是否已到
    pub fn can_retry_now(&self, next_retry_at: i64) -> bool {
        chrono::Utc::now().timestamp_millis() >= next_retry_at
    }
}
