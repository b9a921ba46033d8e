//! 状态生命周期回调
//!
//! feature 模块通过实现 [`StateObserver`] 响应实体变化、操作结果、冲突、
//! 批量操作和实体锁等事件。所有方法都有默认空实现，只需覆盖关心的部分。
//! 多个观察者按注册顺序执行，某个观察者失败会记录错误但继续执行其余观察者。

use crate::entity::{Entity, EntityId};
use crate::error::Result;
use crate::storage::queue::{FailedOperation, PendingOperation};
use crate::sync::{BulkCompletion, BulkOperation, BulkProgress, ConflictDecision, ConflictInfo, EntityLock};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait StateObserver<E: Entity>: Send + Sync {
    /// 服务端确认了新实体（本地创建确认或其他客户端创建）
    async fn on_entity_created(&self, _entity: &E) -> Result<()> {
        Ok(())
    }

    async fn on_entity_updated(&self, _entity: &E) -> Result<()> {
        Ok(())
    }

    async fn on_entity_deleted(&self, _entity_id: &EntityId) -> Result<()> {
        Ok(())
    }

    async fn on_operation_confirmed(&self, _operation: &PendingOperation<E>) -> Result<()> {
        Ok(())
    }

    /// 操作最终失败（本地修改已回滚）
    async fn on_operation_failed(&self, _failed: &FailedOperation<E>) -> Result<()> {
        Ok(())
    }

    /// 检测到冲突；返回 `None` 表示不做决定，交给下一个观察者
    async fn on_conflict_detected(&self, _conflict: &ConflictInfo<E>) -> Option<ConflictDecision> {
        None
    }

    async fn on_sync_completed(&self, _entity_count: usize) -> Result<()> {
        Ok(())
    }

    async fn on_connection_changed(&self, _connected: bool) -> Result<()> {
        Ok(())
    }

    async fn on_bulk_operation_started(&self, _operation: &BulkOperation) -> Result<()> {
        Ok(())
    }

    async fn on_bulk_operation_progress(&self, _progress: &BulkProgress) -> Result<()> {
        Ok(())
    }

    async fn on_bulk_operation_completed(&self, _completion: &BulkCompletion) -> Result<()> {
        Ok(())
    }

    async fn on_entity_locked(&self, _lock: &EntityLock) -> Result<()> {
        Ok(())
    }

    async fn on_entity_unlocked(&self, _entity_id: &EntityId, _user_id: &str) -> Result<()> {
        Ok(())
    }
}

/// 依次通知所有观察者，返回第一个错误
macro_rules! notify_each {
    ($self:ident, $stage:expr, |$hook:ident| $call:expr) => {{
        let hooks = $self.snapshot();
        let mut first_error = None;
        for (index, $hook) in hooks.iter().enumerate() {
            if let Err(e) = $call.await {
                warn!("⚠️ Hook #{} {} 失败: {}", index, $stage, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }};
}

/// 观察者管理器
pub struct LifecycleManager<E: Entity> {
    hooks: RwLock<Vec<Arc<dyn StateObserver<E>>>>,
}

impl<E: Entity> LifecycleManager<E> {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn register_hook(&self, hook: Arc<dyn StateObserver<E>>) {
        let mut hooks = self.hooks.write();
        hooks.push(hook);
        info!("✅ 状态观察者已注册: 当前共 {} 个", hooks.len());
    }

    pub fn clear(&self) {
        self.hooks.write().clear();
    }

    fn snapshot(&self) -> Vec<Arc<dyn StateObserver<E>>> {
        self.hooks.read().clone()
    }

    pub async fn notify_entity_created(&self, entity: &E) -> Result<()> {
        notify_each!(self, "on_entity_created", |hook| hook.on_entity_created(entity))
    }

    pub async fn notify_entity_updated(&self, entity: &E) -> Result<()> {
        notify_each!(self, "on_entity_updated", |hook| hook.on_entity_updated(entity))
    }

    pub async fn notify_entity_deleted(&self, entity_id: &EntityId) -> Result<()> {
        notify_each!(self, "on_entity_deleted", |hook| hook.on_entity_deleted(entity_id))
    }

    pub async fn notify_operation_confirmed(&self, operation: &PendingOperation<E>) -> Result<()> {
        notify_each!(self, "on_operation_confirmed", |hook| hook.on_operation_confirmed(operation))
    }

    pub async fn notify_operation_failed(&self, failed: &FailedOperation<E>) -> Result<()> {
        notify_each!(self, "on_operation_failed", |hook| hook.on_operation_failed(failed))
    }

    pub async fn notify_sync_completed(&self, entity_count: usize) -> Result<()> {
        notify_each!(self, "on_sync_completed", |hook| hook.on_sync_completed(entity_count))
    }

    pub async fn notify_connection_changed(&self, connected: bool) -> Result<()> {
        notify_each!(self, "on_connection_changed", |hook| hook.on_connection_changed(connected))
    }

    pub async fn notify_bulk_started(&self, operation: &BulkOperation) -> Result<()> {
        notify_each!(self, "on_bulk_operation_started", |hook| hook.on_bulk_operation_started(operation))
    }

    pub async fn notify_bulk_progress(&self, progress: &BulkProgress) -> Result<()> {
        notify_each!(self, "on_bulk_operation_progress", |hook| hook.on_bulk_operation_progress(progress))
    }

    pub async fn notify_bulk_completed(&self, completion: &BulkCompletion) -> Result<()> {
        notify_each!(self, "on_bulk_operation_completed", |hook| hook.on_bulk_operation_completed(completion))
    }

    pub async fn notify_entity_locked(&self, lock: &EntityLock) -> Result<()> {
        notify_each!(self, "on_entity_locked", |hook| hook.on_entity_locked(lock))
    }

    pub async fn notify_entity_unlocked(&self, entity_id: &EntityId, user_id: &str) -> Result<()> {
        notify_each!(self, "on_entity_unlocked", |hook| hook.on_entity_unlocked(entity_id, user_id))
    }

    /// 询问观察者如何处理冲突，第一个给出决定的观察者生效
    pub async fn decide_conflict(&self, conflict: &ConflictInfo<E>) -> Option<ConflictDecision> {
        for hook in self.snapshot() {
            if let Some(decision) = hook.on_conflict_detected(conflict).await {
                return Some(decision);
            }
        }
        None
    }
}

impl<E: Entity> Default for LifecycleManager<E> {
    fn default() -> Self {
        Self::new()
    }
}
