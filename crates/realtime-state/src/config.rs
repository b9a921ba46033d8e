//! 状态管理器配置
//!
//! 配置可以直接反序列化（缺省字段取默认值），也可以通过
//! [`StateManagerConfig::builder`] 构造，`build()` 时统一校验。

use crate::error::{RealtimeStateError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 重试退避配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 抖动因子（0.0 - 1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// 单个 feature 的同步配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateManagerConfig {
    /// 功能模块名，如 `budgets`
    pub feature: String,
    /// 实体名，如 `budget`
    pub entity: String,
    /// 是否启用乐观更新；关闭后所有变更直接调用远端服务
    pub enable_optimistic_updates: bool,
    pub enable_conflict_detection: bool,
    /// 关闭后 `is_cache_stale()` 总是返回 true
    pub enable_caching: bool,
    /// 本地视图的有效期（毫秒）
    pub cache_ttl_ms: u64,
    /// 操作入队后首次派发前的等待时间
    pub debounce_ms: u64,
    /// 单个操作最多尝试次数
    pub retry_attempts: u32,
    pub retry: RetryConfig,
    /// 尚未收到实时通道连接事件时是否视为在线（CRUD 走 HTTP，不依赖推送通道）
    pub assume_online: bool,
    /// 不同实体之间的最大并发请求数
    pub max_concurrent_requests: usize,
    /// 单次远端调用超时；`None` 表示不限制
    pub request_timeout_ms: Option<u64>,
    /// 合成乐观实体时写入 ID 的字段名
    pub id_field: String,
    /// 冲突检测时忽略的服务端维护字段
    pub server_managed_fields: Vec<String>,
    /// 失败操作日志容量
    pub failed_log_capacity: usize,
    /// 事件广播缓冲区大小
    pub event_capacity: usize,
    /// 待同步操作日志目录（sled）；`None` 表示只保存在内存
    pub journal_dir: Option<PathBuf>,
    /// 实时事件去重保留时间（秒）
    pub dedup_retention_secs: u64,
    /// 去重缓存触发清理的条目数
    pub dedup_cache_size: usize,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            feature: "default".to_string(),
            entity: "entity".to_string(),
            enable_optimistic_updates: true,
            enable_conflict_detection: true,
            enable_caching: true,
            cache_ttl_ms: 300_000,
            debounce_ms: 300,
            retry_attempts: 3,
            retry: RetryConfig::default(),
            assume_online: true,
            max_concurrent_requests: 4,
            request_timeout_ms: Some(30_000),
            id_field: "id".to_string(),
            server_managed_fields: vec!["updatedAt".to_string(), "updated_at".to_string()],
            failed_log_capacity: 100,
            event_capacity: 256,
            journal_dir: None,
            dedup_retention_secs: 3_600,
            dedup_cache_size: 10_000,
        }
    }
}

impl StateManagerConfig {
    pub fn builder(feature: impl Into<String>, entity: impl Into<String>) -> StateManagerConfigBuilder {
        StateManagerConfigBuilder::new(feature, entity)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// 日志中使用的标签，如 `budgets/budget`
    pub fn label(&self) -> String {
        format!("{}/{}", self.feature, self.entity)
    }

    pub fn validate(&self) -> Result<()> {
        if self.feature.trim().is_empty() || self.entity.trim().is_empty() {
            return Err(RealtimeStateError::Config("feature and entity must not be empty".to_string()));
        }
        if self.id_field.trim().is_empty() {
            return Err(RealtimeStateError::Config("id_field must not be empty".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(RealtimeStateError::Config("retry_attempts must be at least 1".to_string()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(RealtimeStateError::Config(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(RealtimeStateError::Config("event_capacity must be at least 1".to_string()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(RealtimeStateError::Config("backoff_factor must be >= 1.0".to_string()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_factor) {
            return Err(RealtimeStateError::Config("jitter_factor must be in [0, 1)".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(RealtimeStateError::Config(
                "retry base delay exceeds max delay".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct StateManagerConfigBuilder {
    config: StateManagerConfig,
}

impl StateManagerConfigBuilder {
    pub fn new(feature: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            config: StateManagerConfig {
                feature: feature.into(),
                entity: entity.into(),
                ..StateManagerConfig::default()
            },
        }
    }

    pub fn optimistic_updates(mut self, enabled: bool) -> Self {
        self.config.enable_optimistic_updates = enabled;
        self
    }

    pub fn conflict_detection(mut self, enabled: bool) -> Self {
        self.config.enable_conflict_detection = enabled;
        self
    }

    pub fn caching(mut self, enabled: bool, ttl_ms: u64) -> Self {
        self.config.enable_caching = enabled;
        self.config.cache_ttl_ms = ttl_ms;
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.debounce_ms = ms;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    /// 设置退避参数
    pub fn retry_backoff(mut self, base_delay_ms: u64, max_delay_ms: u64, backoff_factor: f64) -> Self {
        self.config.retry.base_delay_ms = base_delay_ms;
        self.config.retry.max_delay_ms = max_delay_ms;
        self.config.retry.backoff_factor = backoff_factor;
        self
    }

    pub fn retry_jitter(mut self, jitter_factor: f64) -> Self {
        self.config.retry.jitter_factor = jitter_factor;
        self
    }

    pub fn assume_online(mut self, online: bool) -> Self {
        self.config.assume_online = online;
        self
    }

    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.config.max_concurrent_requests = max;
        self
    }

    pub fn request_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.config.request_timeout_ms = timeout;
        self
    }

    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.config.id_field = field.into();
        self
    }

    pub fn server_managed_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.server_managed_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn failed_log_capacity(mut self, capacity: usize) -> Self {
        self.config.failed_log_capacity = capacity;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// 启用本地操作日志（重启后恢复未完成的操作）
    pub fn journal_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.journal_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn dedup(mut self, retention_secs: u64, cache_size: usize) -> Self {
        self.config.dedup_retention_secs = retention_secs;
        self.config.dedup_cache_size = cache_size;
        self
    }

    pub fn build(self) -> Result<StateManagerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
