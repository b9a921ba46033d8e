use crate::entity::{EntityId, Patch};
use crate::error::RealtimeStateError;
use crate::storage::queue::retry_policy::FailureReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// 等待派发（含退避等待）
    Pending,
    /// 远端调用进行中
    InFlight,
    /// 重试耗尽或被拒绝
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "等待同步"),
            OperationStatus::InFlight => write!(f, "同步中"),
            OperationStatus::Failed => write!(f, "同步失败"),
        }
    }
}

/// 待同步操作
///
/// `base` 是变更发生时实体的服务端确认版本，用于冲突检测；创建操作没有 base。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation<E> {
    pub id: String,
    pub entity_id: EntityId,
    pub kind: OperationKind,
    pub payload: Patch,
    pub base: Option<E>,
    pub attempts: u32,
    /// 创建时间（UTC 毫秒）
    pub created_at: i64,
    pub status: OperationStatus,
    /// 全局入队序号，决定展示顺序
    pub seq: u64,
    pub last_error: Option<String>,
    /// 下一次重试时间（UTC 毫秒）
    pub next_retry_at: Option<i64>,
}

impl<E> PendingOperation<E> {
    pub fn new(entity_id: EntityId, kind: OperationKind, payload: Patch, base: Option<E>) -> Self {
        Self {
            id: format!("op_{}", uuid::Uuid::new_v4().simple()),
            entity_id,
            kind,
            payload,
            base,
            attempts: 0,
            created_at: Utc::now().timestamp_millis(),
            status: OperationStatus::Pending,
            seq: 0,
            last_error: None,
            next_retry_at: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == OperationStatus::InFlight
    }
}

/// 失败操作日志条目
#[derive(Debug, Clone)]
pub struct FailedOperation<E> {
    pub operation: PendingOperation<E>,
    pub error: RealtimeStateError,
    pub reason: FailureReason,
    pub failed_at: DateTime<Utc>,
}
