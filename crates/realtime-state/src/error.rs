//! 错误类型定义
//!
//! 所有对外 API 统一返回 [`Result<T>`]。错误需要在等待者、失败日志和事件之间扇出，
//! 因此 [`RealtimeStateError`] 实现了 `Clone`，底层错误统一转换为字符串保存。

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeStateError {
    /// 传输层错误（连接重置、DNS 等）
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Not connected")]
    NotConnected,
    /// 服务端 5xx
    #[error("Server error [{status}]: {message}")]
    Server { status: u16, message: String },
    /// 服务端拒绝（4xx），不会重试
    #[error("Rejected [{status}]: {message}")]
    Rejected { status: u16, message: String },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// 冲突以 accept_server 结束时，本地操作以该错误结束
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for RealtimeStateError {
    fn from(error: serde_json::Error) -> Self {
        RealtimeStateError::Serialization(error.to_string())
    }
}

impl From<sled::Error> for RealtimeStateError {
    fn from(error: sled::Error) -> Self {
        RealtimeStateError::Storage(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RealtimeStateError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        RealtimeStateError::Timeout(error.to_string())
    }
}

impl RealtimeStateError {
    /// 根据 HTTP 风格的状态码构造错误
    ///
    /// - 404 → `NotFound`
    /// - 409 → `Conflict`
    /// - 400 / 422 → `Validation`
    /// - 其余 4xx → `Rejected`
    /// - 5xx → `Server`
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => RealtimeStateError::NotFound(message),
            409 => RealtimeStateError::Conflict(message),
            400 | 422 => RealtimeStateError::Validation(message),
            400..=499 => RealtimeStateError::Rejected { status, message },
            _ => RealtimeStateError::Server { status, message },
        }
    }

    /// 对应的状态码（如果有）
    pub fn status(&self) -> Option<u16> {
        match self {
            RealtimeStateError::Server { status, .. } | RealtimeStateError::Rejected { status, .. } => {
                Some(*status)
            }
            RealtimeStateError::NotFound(_) => Some(404),
            RealtimeStateError::Conflict(_) => Some(409),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RealtimeStateError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RealtimeStateError>;
