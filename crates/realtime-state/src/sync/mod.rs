//! 同步模块
//!
//! - `conflict`：冲突检测与解决策略
//! - `realtime`：推送通道消息的解析

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod conflict;
pub mod realtime;

pub use conflict::{ConflictDecision, ConflictDetector, ConflictInfo, ConflictResolution, Detection, MergeFn};
pub use realtime::{BulkCompletion, BulkOperation, BulkProgress, EntityLock, LockRelease, RealtimeEnvelope, RealtimeMessage};

/// 与服务端的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// 空闲
    Idle,
    /// 正在拉取快照
    Syncing,
    /// 最近一次同步失败
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "空闲"),
            SyncStatus::Syncing => write!(f, "同步中"),
            SyncStatus::Error => write!(f, "同步失败"),
        }
    }
}

/// 同步统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStats {
    pub local_count: usize,
    pub server_count: usize,
    pub conflict_count: usize,
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub is_connected: bool,
    /// 本地视图与服务端快照是否不同
    pub has_changes: bool,
}
