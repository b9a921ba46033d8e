//! 事件系统模块 - 同步引擎的遥测与通知
//!
//! 功能包括：
//! - 本地状态变更通知
//! - 操作生命周期事件（入队、派发、确认、重试、失败）
//! - 冲突与连接状态事件
//! - 广播订阅、过滤订阅和按名称注册的监听器

use crate::connection_state::ConnectionStatus;
use crate::entity::EntityId;
use crate::storage::queue::OperationKind;
use crate::sync::SyncStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 同步事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 本地视图发生变化
    StateChanged {
        local_count: usize,
        pending_count: usize,
        conflict_count: usize,
        timestamp: i64,
    },
    SyncStatusChanged {
        old_status: SyncStatus,
        new_status: SyncStatus,
        error: Option<String>,
        timestamp: i64,
    },
    /// 全量同步完成
    SyncCompleted {
        entity_count: usize,
        duration_ms: u64,
        timestamp: i64,
    },
    OperationEnqueued {
        operation_id: String,
        entity_id: EntityId,
        kind: OperationKind,
        timestamp: i64,
    },
    OperationDispatched {
        operation_id: String,
        entity_id: EntityId,
        kind: OperationKind,
        attempt: u32,
        timestamp: i64,
    },
    OperationConfirmed {
        operation_id: String,
        entity_id: EntityId,
        kind: OperationKind,
        timestamp: i64,
    },
    OperationRetrying {
        operation_id: String,
        entity_id: EntityId,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: i64,
    },
    /// 操作最终失败，本地修改已回滚
    OperationFailed {
        operation_id: String,
        entity_id: EntityId,
        kind: OperationKind,
        error: String,
        timestamp: i64,
    },
    OperationCancelled {
        operation_id: String,
        entity_id: EntityId,
        timestamp: i64,
    },
    /// 创建确认后临时 ID 被替换为服务端 ID
    TemporaryIdReplaced {
        temporary_id: EntityId,
        server_id: EntityId,
        timestamp: i64,
    },
    /// 实时事件改变了本地状态
    RemoteChangeApplied {
        entity_id: EntityId,
        action: String,
        timestamp: i64,
    },
    /// 实时事件被忽略（重复、内容未变化或无法解析）
    ServerEventIgnored {
        entity_id: Option<EntityId>,
        reason: String,
        timestamp: i64,
    },
    ConflictDetected {
        entity_id: EntityId,
        operation_id: String,
        fields: Vec<String>,
        timestamp: i64,
    },
    ConflictResolved {
        entity_id: EntityId,
        resolution: String,
        timestamp: i64,
    },
    ConnectionStateChanged {
        old_status: ConnectionStatus,
        new_status: ConnectionStatus,
        timestamp: i64,
    },
    BulkOperationStarted {
        operation_id: String,
        total: Option<u64>,
        timestamp: i64,
    },
    BulkOperationProgress {
        operation_id: String,
        processed: Option<u64>,
        timestamp: i64,
    },
    BulkOperationCompleted {
        operation_id: String,
        timestamp: i64,
    },
    EntityLocked {
        entity_id: EntityId,
        user_id: String,
        lock_type: Option<String>,
        timestamp: i64,
    },
    EntityUnlocked {
        entity_id: EntityId,
        user_id: String,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::StateChanged { .. } => "state_changed",
            SyncEvent::SyncStatusChanged { .. } => "sync_status_changed",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::OperationEnqueued { .. } => "operation_enqueued",
            SyncEvent::OperationDispatched { .. } => "operation_dispatched",
            SyncEvent::OperationConfirmed { .. } => "operation_confirmed",
            SyncEvent::OperationRetrying { .. } => "operation_retrying",
            SyncEvent::OperationFailed { .. } => "operation_failed",
            SyncEvent::OperationCancelled { .. } => "operation_cancelled",
            SyncEvent::TemporaryIdReplaced { .. } => "temporary_id_replaced",
            SyncEvent::RemoteChangeApplied { .. } => "remote_change_applied",
            SyncEvent::ServerEventIgnored { .. } => "server_event_ignored",
            SyncEvent::ConflictDetected { .. } => "conflict_detected",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            SyncEvent::BulkOperationStarted { .. } => "bulk_operation_started",
            SyncEvent::BulkOperationProgress { .. } => "bulk_operation_progress",
            SyncEvent::BulkOperationCompleted { .. } => "bulk_operation_completed",
            SyncEvent::EntityLocked { .. } => "entity_locked",
            SyncEvent::EntityUnlocked { .. } => "entity_unlocked",
        }
    }

    /// 获取事件时间戳（UTC毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::StateChanged { timestamp, .. }
            | SyncEvent::SyncStatusChanged { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::OperationEnqueued { timestamp, .. }
            | SyncEvent::OperationDispatched { timestamp, .. }
            | SyncEvent::OperationConfirmed { timestamp, .. }
            | SyncEvent::OperationRetrying { timestamp, .. }
            | SyncEvent::OperationFailed { timestamp, .. }
            | SyncEvent::OperationCancelled { timestamp, .. }
            | SyncEvent::TemporaryIdReplaced { timestamp, .. }
            | SyncEvent::RemoteChangeApplied { timestamp, .. }
            | SyncEvent::ServerEventIgnored { timestamp, .. }
            | SyncEvent::ConflictDetected { timestamp, .. }
            | SyncEvent::ConflictResolved { timestamp, .. }
            | SyncEvent::ConnectionStateChanged { timestamp, .. }
            | SyncEvent::BulkOperationStarted { timestamp, .. }
            | SyncEvent::BulkOperationProgress { timestamp, .. }
            | SyncEvent::BulkOperationCompleted { timestamp, .. }
            | SyncEvent::EntityLocked { timestamp, .. }
            | SyncEvent::EntityUnlocked { timestamp, .. } => *timestamp,
        }
    }

    /// 获取事件相关的实体ID
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            SyncEvent::OperationEnqueued { entity_id, .. }
            | SyncEvent::OperationDispatched { entity_id, .. }
            | SyncEvent::OperationConfirmed { entity_id, .. }
            | SyncEvent::OperationRetrying { entity_id, .. }
            | SyncEvent::OperationFailed { entity_id, .. }
            | SyncEvent::OperationCancelled { entity_id, .. }
            | SyncEvent::RemoteChangeApplied { entity_id, .. }
            | SyncEvent::ConflictDetected { entity_id, .. }
            | SyncEvent::ConflictResolved { entity_id, .. }
            | SyncEvent::EntityLocked { entity_id, .. }
            | SyncEvent::EntityUnlocked { entity_id, .. } => Some(entity_id),
            SyncEvent::TemporaryIdReplaced { server_id, .. } => Some(server_id),
            SyncEvent::ServerEventIgnored { entity_id, .. } => entity_id.as_ref(),
            _ => None,
        }
    }

    /// 获取事件相关的操作ID
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            SyncEvent::OperationEnqueued { operation_id, .. }
            | SyncEvent::OperationDispatched { operation_id, .. }
            | SyncEvent::OperationConfirmed { operation_id, .. }
            | SyncEvent::OperationRetrying { operation_id, .. }
            | SyncEvent::OperationFailed { operation_id, .. }
            | SyncEvent::OperationCancelled { operation_id, .. }
            | SyncEvent::ConflictDetected { operation_id, .. } => Some(operation_id),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 实体ID过滤器
    pub entity_ids: Option<Vec<EntityId>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(event_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_entity_ids(mut self, entity_ids: Vec<EntityId>) -> Self {
        self.entity_ids = Some(entity_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref entity_ids) = self.entity_ids {
            match event.entity_id() {
                Some(id) if entity_ids.contains(id) => {}
                _ => return false, // 事件没有实体ID但过滤器要求有
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    /// 事件类型 -> 监听器，`*` 匹配所有事件
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub async fn emit_all(&self, events: Vec<SyncEvent>) {
        for event in events {
            self.emit(event).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器；`event_type` 为 `*` 时接收所有事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners.entry(event_type.to_string()).or_default().push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
