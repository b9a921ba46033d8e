//! 存储层：本地视图、待同步队列、操作日志与事件去重

pub mod deduplication;
pub mod journal;
pub mod queue;
pub mod store;

pub use deduplication::EventDeduplicator;
pub use journal::OperationJournal;
pub use queue::{
    FailedOperation, FailureReason, OperationKind, OperationStatus, PendingOperation, PendingQueue, QueueStats,
    RetryDecision, RetryManager, RetryPolicy,
};
pub use store::{apply_pending_overlay, LocalStore};
