//! Realtime State - 客户端乐观同步引擎
//!
//! 为每个 feature（预算、交易、账户……）提供统一的实时状态管理：
//! - ⚡ 乐观更新：本地修改立即可见，后台提交，失败自动回滚
//! - 📋 按实体串行的待同步队列，指数退避重试，临时 ID 自动替换
//! - 🚨 冲突检测：并发修改时记录冲突，默认采用服务端版本
//! - 📡 实时事件接入：幂等写入、事件去重、重连后补拉快照
//! - 🔒 批量操作与实体锁跟踪
//! - ⚙️ 事件总线 + 状态快照订阅 + 生命周期回调
//! - 💾 可选的待同步操作日志（sled），重启后恢复
//!
//! # 快速开始
//!
//! ```rust,ignore
//! use realtime_state::{RealtimeStateManager, StateManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> realtime_state::Result<()> {
//!     let config = StateManagerConfig::builder("budgets", "budget")
//!         .debounce_ms(300)
//!         .retry_attempts(3)
//!         .build()?;
//!
//!     // BudgetService 实现了 EntityService<Budget>
//!     let manager = RealtimeStateManager::new(config, Arc::new(BudgetService::new()))?;
//!     manager.initialize().await?;
//!
//!     // 本地立即可见，确认后临时 ID 被替换为服务端 ID
//!     let created = manager.optimistic_create(patch).await?;
//!     let confirmed = created.confirmation.confirmed().await?;
//!
//!     // 推送通道的事件交给管理器
//!     manager.handle_realtime_message(envelope).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection_state;
pub mod entity;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod service;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{RetryConfig, StateManagerConfig, StateManagerConfigBuilder};
pub use connection_state::{ConnectionState, ConnectionStatus};
pub use entity::{Entity, EntityId, Patch};
pub use error::{RealtimeStateError, Result};
pub use events::{EventFilter, EventManager, EventStats, FilteredEventReceiver, SyncEvent};
pub use lifecycle::{LifecycleManager, StateObserver};
pub use manager::{Confirmation, Optimistic, RealtimeStateManager, StateSnapshot};
pub use service::EntityService;
pub use storage::{FailedOperation, FailureReason, OperationKind, OperationStatus, PendingOperation, QueueStats};
pub use sync::{
    BulkCompletion, BulkOperation, BulkProgress, ConflictDecision, ConflictInfo, ConflictResolution, EntityLock,
    LockRelease, RealtimeEnvelope, RealtimeMessage, SyncStats, SyncStatus,
};
