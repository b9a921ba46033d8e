//! 推送通道消息
//!
//! 传输层（WebSocket/SSE）把收到的帧解码为 [`RealtimeEnvelope`] 后交给状态管理器，
//! 动作名同时接受 `created` 与 `entity.created` 两种写法。

use crate::entity::{Entity, EntityId};
use crate::error::{RealtimeStateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 原始推送消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEnvelope {
    /// 服务端事件 ID，用于重连重放时去重
    #[serde(default, alias = "eventId")]
    pub event_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

impl RealtimeEnvelope {
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: None,
            action: action.into(),
            data,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// 解析为强类型消息；`id_field` 用于从删除事件中取出实体 ID
    pub fn into_message<E: Entity>(self, id_field: &str) -> Result<RealtimeMessage<E>> {
        let action = self.action.trim().to_ascii_lowercase();
        let message = match action.as_str() {
            "created" | "entity.created" => RealtimeMessage::Created(serde_json::from_value(self.data)?),
            "updated" | "entity.updated" => RealtimeMessage::Updated(serde_json::from_value(self.data)?),
            "deleted" | "entity.deleted" => RealtimeMessage::Deleted(extract_id(&self.data, id_field)?),
            "bulk_started" | "bulk.started" => RealtimeMessage::BulkStarted(serde_json::from_value(self.data)?),
            "bulk_progress" | "bulk.progress" => RealtimeMessage::BulkProgress(serde_json::from_value(self.data)?),
            "bulk_completed" | "bulk.completed" => {
                RealtimeMessage::BulkCompleted(serde_json::from_value(self.data)?)
            }
            "lock_acquired" | "lock.acquired" => RealtimeMessage::LockAcquired(serde_json::from_value(self.data)?),
            "lock_released" | "lock.released" => RealtimeMessage::LockReleased(serde_json::from_value(self.data)?),
            "connected" | "connection.connected" => RealtimeMessage::Connected,
            "disconnected" | "connection.disconnected" => RealtimeMessage::Disconnected,
            _ => {
                return Err(RealtimeStateError::InvalidArgument(format!(
                    "unknown real-time action: {}",
                    self.action
                )))
            }
        };
        Ok(message)
    }
}

/// 删除事件的载荷可以是完整实体、`{id}` 对象或裸 ID
fn extract_id(data: &Value, id_field: &str) -> Result<EntityId> {
    let candidate = match data {
        Value::Object(map) => map.get(id_field).or_else(|| map.get("id")),
        other => Some(other),
    };
    candidate
        .and_then(EntityId::from_value)
        .ok_or_else(|| RealtimeStateError::InvalidArgument(format!("delete event without id: {}", data)))
}

/// 解析后的推送消息
#[derive(Debug, Clone)]
pub enum RealtimeMessage<E> {
    Created(E),
    Updated(E),
    Deleted(EntityId),
    BulkStarted(BulkOperation),
    BulkProgress(BulkProgress),
    BulkCompleted(BulkCompletion),
    LockAcquired(EntityLock),
    LockReleased(LockRelease),
    Connected,
    Disconnected,
}

impl<E> RealtimeMessage<E> {
    pub fn action(&self) -> &'static str {
        match self {
            RealtimeMessage::Created(_) => "created",
            RealtimeMessage::Updated(_) => "updated",
            RealtimeMessage::Deleted(_) => "deleted",
            RealtimeMessage::BulkStarted(_) => "bulk_started",
            RealtimeMessage::BulkProgress(_) => "bulk_progress",
            RealtimeMessage::BulkCompleted(_) => "bulk_completed",
            RealtimeMessage::LockAcquired(_) => "lock_acquired",
            RealtimeMessage::LockReleased(_) => "lock_released",
            RealtimeMessage::Connected => "connected",
            RealtimeMessage::Disconnected => "disconnected",
        }
    }
}

/// 批量操作开始
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOperation {
    #[serde(alias = "operationId")]
    pub operation_id: String,
    #[serde(default)]
    pub total: Option<u64>,
    /// 操作类型，如 `import`、`delete`
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub processed: u64,
    #[serde(default = "Utc::now", alias = "startedAt")]
    pub started_at: DateTime<Utc>,
}

/// 批量操作进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkProgress {
    #[serde(alias = "operationId")]
    pub operation_id: String,
    /// 进度载荷（数字或对象），原样保留
    #[serde(default)]
    pub progress: Value,
}

impl BulkProgress {
    /// 已处理数量：`progress` 为数字或包含 `processed`/`completed` 字段时可解析
    pub fn processed(&self) -> Option<u64> {
        match &self.progress {
            Value::Number(n) => n.as_u64(),
            Value::Object(map) => map
                .get("processed")
                .or_else(|| map.get("completed"))
                .and_then(Value::as_u64),
            _ => None,
        }
    }
}

/// 批量操作完成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkCompletion {
    #[serde(alias = "operationId")]
    pub operation_id: String,
    #[serde(default)]
    pub results: Value,
}

/// 实体锁（仅作提示，不阻止本地修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLock {
    #[serde(alias = "id", alias = "entityId")]
    pub entity_id: EntityId,
    #[serde(alias = "userId")]
    pub user_id: String,
    #[serde(default, alias = "lockType")]
    pub lock_type: Option<String>,
    #[serde(default = "Utc::now", alias = "lockedAt")]
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRelease {
    #[serde(alias = "id", alias = "entityId")]
    pub entity_id: EntityId,
    #[serde(alias = "userId")]
    pub user_id: String,
}
