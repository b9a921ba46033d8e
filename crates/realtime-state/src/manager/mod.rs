//! 实时状态管理器
//!
//! [`RealtimeStateManager`] 是同步引擎的协调者：
//!
//! - 乐观变更立即作用于本地视图，同时进入按实体划分的待同步队列
//! - 后台任务按实体串行、实体间并发地调用远端服务，失败时退避重试或回滚
//! - 实时事件经过冲突检测后写入服务端快照
//! - 连接恢复、批量操作完成时重新拉取全量快照
//!
//! 所有状态都在一把 `parking_lot::Mutex` 里，任何 `.await` 之前都会释放；
//! 事件、回调和确认都在释放锁之后发出。

mod dispatch;
mod ingest;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch, Notify, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::config::StateManagerConfig;
use crate::connection_state::ConnectionState;
use crate::entity::{self, Entity, EntityId, Patch};
use crate::error::{RealtimeStateError, Result};
use crate::events::{now_millis, EventFilter, EventManager, EventStats, FilteredEventReceiver, SyncEvent};
use crate::lifecycle::{LifecycleManager, StateObserver};
use crate::service::EntityService;
use crate::storage::{
    EventDeduplicator, FailedOperation, LocalStore, OperationJournal, OperationKind, PendingOperation, PendingQueue,
    QueueStats, RetryManager, RetryPolicy,
};
use crate::sync::{BulkOperation, ConflictDetector, ConflictInfo, Detection, EntityLock, SyncStats, SyncStatus};

type Waiter<E> = oneshot::Sender<Result<Option<E>>>;

/// 状态快照，通过 `subscribe_state()` 推送给 UI
#[derive(Debug, Clone)]
pub struct StateSnapshot<E> {
    /// 本地视图（含未确认修改）
    pub entities: Vec<E>,
    pub pending_count: usize,
    pub conflict_count: usize,
    pub status: SyncStatus,
    pub is_connected: bool,
    /// 每次发布递增
    pub revision: u64,
}

/// 远端确认的句柄
///
/// 创建/更新确认后得到服务端版本，删除确认后得到 `None`；
/// 操作最终失败、被冲突丢弃或被取消时返回 `Err`。
#[derive(Debug)]
pub struct Confirmation<E> {
    operation_id: Option<String>,
    entity_id: EntityId,
    receiver: oneshot::Receiver<Result<Option<E>>>,
}

impl<E> Confirmation<E> {
    fn pending(operation_id: String, entity_id: EntityId) -> (Self, Waiter<E>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                operation_id: Some(operation_id),
                entity_id,
                receiver: rx,
            },
            tx,
        )
    }

    fn ready(entity_id: EntityId, result: Result<Option<E>>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            operation_id: None,
            entity_id,
            receiver: rx,
        }
    }

    /// 对应的待同步操作；未经过队列（直接调用或本地取消）时为 `None`
    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref()
    }

    /// 发起操作时的实体 ID（创建时为临时 ID）
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub async fn confirmed(self) -> Result<Option<E>> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(RealtimeStateError::Cancelled("state manager dropped".to_string())),
        }
    }
}

/// 乐观变更的结果：立即可见的实体 + 远端确认句柄
#[derive(Debug)]
pub struct Optimistic<E> {
    pub entity: E,
    pub confirmation: Confirmation<E>,
}

pub(crate) struct ManagerState<E> {
    store: LocalStore<E>,
    queue: PendingQueue<E>,
    conflicts: HashMap<EntityId, ConflictInfo<E>>,
    status: SyncStatus,
    last_error: Option<String>,
    last_sync: Option<DateTime<Utc>>,
    connection: ConnectionState,
    locks: HashMap<EntityId, EntityLock>,
    bulk: HashMap<String, BulkOperation>,
    /// 有后台任务在处理的实体通道
    running: HashSet<EntityId>,
    waiters: HashMap<String, Waiter<E>>,
    /// 在途创建的推送回声，按操作 ID 暂扣到创建结果返回
    held_echoes: HashMap<String, E>,
    /// 本地视图最近一次变化的时间
    last_cache_update: Option<Instant>,
    /// `reset()` 时递增，旧的后台任务据此退出
    epoch: u64,
    revision: u64,
    initialized: bool,
}

impl<E: Entity> ManagerState<E> {
    fn recompute(&mut self) {
        self.store.recompute(&self.queue);
    }

    fn snapshot(&mut self) -> StateSnapshot<E> {
        self.revision += 1;
        StateSnapshot {
            entities: self.store.local_state(),
            pending_count: self.queue.len(),
            conflict_count: self.conflicts.len(),
            status: self.status,
            is_connected: self.connection.is_connected(),
            revision: self.revision,
        }
    }

    fn state_changed(&self) -> SyncEvent {
        SyncEvent::StateChanged {
            local_count: self.store.local_len(),
            pending_count: self.queue.len(),
            conflict_count: self.conflicts.len(),
            timestamp: now_millis(),
        }
    }
}

/// 释放锁之后要执行的副作用
pub(crate) struct Effects<E> {
    events: Vec<SyncEvent>,
    resolved: Vec<(Waiter<E>, Result<Option<E>>)>,
    snapshot: Option<StateSnapshot<E>>,
    schedule: Vec<EntityId>,
}

impl<E> Default for Effects<E> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            resolved: Vec::new(),
            snapshot: None,
            schedule: Vec::new(),
        }
    }
}

impl<E: Entity> Effects<E> {
    /// 记录状态变化：StateChanged 事件 + 新快照
    fn changed(&mut self, state: &mut ManagerState<E>) {
        state.last_cache_update = Some(Instant::now());
        self.events.push(state.state_changed());
        self.snapshot = Some(state.snapshot());
    }

    fn resolve(&mut self, state: &mut ManagerState<E>, operation_id: &str, result: Result<Option<E>>) {
        if let Some(waiter) = state.waiters.remove(operation_id) {
            self.resolved.push((waiter, result));
        }
    }
}

pub(crate) struct Inner<E: Entity> {
    config: StateManagerConfig,
    label: String,
    service: Arc<dyn EntityService<E>>,
    hooks: LifecycleManager<E>,
    events: EventManager,
    retry: RetryManager,
    detector: ConflictDetector,
    dedup: EventDeduplicator,
    journal: Option<OperationJournal>,
    permits: Semaphore,
    /// 唤醒正在退避等待的通道
    wake: Notify,
    sync_lock: tokio::sync::Mutex<()>,
    state: Mutex<ManagerState<E>>,
    snapshot_tx: watch::Sender<StateSnapshot<E>>,
}

impl<E: Entity> Inner<E> {
    /// 执行副作用：发事件、发布快照、兑现确认，最后调度通道
    async fn apply(self: &Arc<Self>, effects: Effects<E>) {
        self.events.emit_all(effects.events).await;
        if let Some(snapshot) = effects.snapshot {
            self.snapshot_tx.send_replace(snapshot);
        }
        for (waiter, result) in effects.resolved {
            let _ = waiter.send(result);
        }
        if !effects.schedule.is_empty() {
            for entity_id in effects.schedule {
                self.schedule(entity_id);
            }
            self.wake.notify_waiters();
        }
    }

    /// 带超时的远端调用
    async fn call<T, F>(&self, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match self.config.request_timeout() {
            Some(limit) => tokio::time::timeout(limit, future).await?,
            None => future.await,
        }
    }

    fn persist(&self, op: &PendingOperation<E>) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.persist(op) {
                error!("❌ [{}] 写入操作日志失败 {}: {}", self.label, op.id, e);
            }
        }
    }

    fn forget(&self, operation_id: &str) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.remove(operation_id) {
                error!("❌ [{}] 删除操作日志失败 {}: {}", self.label, operation_id, e);
            }
        }
    }
}

/// 实时状态管理器
///
/// 可廉价克隆，所有克隆共享同一份状态。
pub struct RealtimeStateManager<E: Entity> {
    inner: Arc<Inner<E>>,
}

impl<E: Entity> Clone for RealtimeStateManager<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Entity> RealtimeStateManager<E> {
    /// 创建状态管理器；配置了 `journal_dir` 时会打开操作日志
    pub fn new(config: StateManagerConfig, service: Arc<dyn EntityService<E>>) -> Result<Self> {
        config.validate()?;
        let label = config.label();

        let journal = match &config.journal_dir {
            Some(dir) => Some(OperationJournal::open(dir, &label)?),
            None => None,
        };

        let mut state = ManagerState {
            store: LocalStore::new(config.id_field.clone()),
            queue: PendingQueue::new(config.failed_log_capacity),
            conflicts: HashMap::new(),
            status: SyncStatus::Idle,
            last_error: None,
            last_sync: None,
            connection: ConnectionState::new(label.clone(), config.assume_online),
            locks: HashMap::new(),
            bulk: HashMap::new(),
            running: HashSet::new(),
            waiters: HashMap::new(),
            held_echoes: HashMap::new(),
            last_cache_update: None,
            epoch: 0,
            revision: 0,
            initialized: false,
        };
        let (snapshot_tx, _) = watch::channel(state.snapshot());

        info!(
            "✅ [{}] 实时状态管理器已创建 (optimistic={}, conflict_detection={}, retry_attempts={})",
            label, config.enable_optimistic_updates, config.enable_conflict_detection, config.retry_attempts
        );

        let inner = Inner {
            label,
            service,
            hooks: LifecycleManager::new(),
            events: EventManager::new(config.event_capacity),
            retry: RetryManager::new(RetryPolicy::from_config(&config)),
            detector: ConflictDetector::new(config.enable_conflict_detection, config.server_managed_fields.clone()),
            dedup: EventDeduplicator::new(
                std::time::Duration::from_secs(config.dedup_retention_secs),
                config.dedup_cache_size,
            ),
            journal,
            permits: Semaphore::new(config.max_concurrent_requests),
            wake: Notify::new(),
            sync_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
            snapshot_tx,
            config,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn config(&self) -> &StateManagerConfig {
        &self.inner.config
    }

    /// 注册状态观察者
    pub fn register_hook(&self, hook: Arc<dyn StateObserver<E>>) {
        self.inner.hooks.register_hook(hook);
    }

    /// 初始化：恢复操作日志中的待同步操作，然后拉取全量快照
    ///
    /// 快照拉取失败时返回错误，但已恢复的操作仍然保留在队列中。
    pub async fn initialize(&self) -> Result<()> {
        let restored = match &self.inner.journal {
            Some(journal) => journal.load_all::<E>()?,
            None => Vec::new(),
        };

        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if !restored.is_empty() {
                info!("📒 [{}] 恢复 {} 个待同步操作", self.inner.label, restored.len());
                state.queue.restore(restored);
                state.recompute();
                effects.changed(state);
            }
            state.initialized = true;
        }
        self.inner.apply(effects).await;

        self.sync_with_server().await
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    /// 拉取全量快照并与本地状态合并
    ///
    /// 失败时状态变为 `Error`，本地状态保持不变。并发调用会串行执行。
    #[instrument(skip(self), fields(feature = %self.inner.label))]
    pub async fn sync_with_server(&self) -> Result<()> {
        let _sync_guard = self.inner.sync_lock.lock().await;
        let started = Instant::now();

        let old_status = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.status, SyncStatus::Syncing)
        };
        self.inner
            .events
            .emit(SyncEvent::SyncStatusChanged {
                old_status,
                new_status: SyncStatus::Syncing,
                error: None,
                timestamp: now_millis(),
            })
            .await;
        debug!("🔄 [{}] 开始同步", self.inner.label);

        match self.inner.call(self.inner.service.fetch_all()).await {
            Ok(entities) => {
                let count = entities.len();
                let mut effects = Effects::default();
                let detected = {
                    let mut guard = self.inner.state.lock();
                    let state = &mut *guard;
                    let pairs: Vec<(EntityId, E)> = entities
                        .into_iter()
                        .map(|e| (self.inner.service.extract_entity_id(&e), e))
                        .collect();
                    state.store.apply_server_snapshot(pairs, &state.queue);

                    let detected = self.redetect_conflicts(state, &mut effects);

                    state.status = SyncStatus::Idle;
                    state.last_error = None;
                    state.last_sync = Some(Utc::now());
                    effects.events.push(SyncEvent::SyncStatusChanged {
                        old_status: SyncStatus::Syncing,
                        new_status: SyncStatus::Idle,
                        error: None,
                        timestamp: now_millis(),
                    });
                    effects.events.push(SyncEvent::SyncCompleted {
                        entity_count: count,
                        duration_ms: started.elapsed().as_millis() as u64,
                        timestamp: now_millis(),
                    });
                    effects.changed(state);
                    if state.connection.is_online() {
                        effects.schedule = state.queue.heads().iter().map(|op| op.entity_id.clone()).collect();
                    }
                    detected
                };
                self.inner.apply(effects).await;
                info!("✅ [{}] 同步完成: {} 个实体, 耗时 {:?}", self.inner.label, count, started.elapsed());

                if let Err(e) = self.inner.hooks.notify_sync_completed(count).await {
                    warn!("⚠️ [{}] on_sync_completed 回调失败: {}", self.inner.label, e);
                }
                for conflict in detected {
                    self.decide_conflict(conflict).await;
                }
                Ok(())
            }
            Err(e) => {
                let mut effects = Effects::default();
                {
                    let mut guard = self.inner.state.lock();
                    let state = &mut *guard;
                    state.status = SyncStatus::Error;
                    state.last_error = Some(e.to_string());
                    effects.events.push(SyncEvent::SyncStatusChanged {
                        old_status: SyncStatus::Syncing,
                        new_status: SyncStatus::Error,
                        error: Some(e.to_string()),
                        timestamp: now_millis(),
                    });
                    effects.snapshot = Some(state.snapshot());
                }
                self.inner.apply(effects).await;
                error!("❌ [{}] 同步失败: {}", self.inner.label, e);
                Err(e)
            }
        }
    }

    /// 快照替换后重新检查活跃操作是否与新的服务端版本冲突
    fn redetect_conflicts(&self, state: &mut ManagerState<E>, effects: &mut Effects<E>) -> Vec<ConflictInfo<E>> {
        // 没有待同步操作的冲突已经失效
        let stale: Vec<EntityId> = state
            .conflicts
            .keys()
            .filter(|id| !state.queue.has_pending(id))
            .cloned()
            .collect();
        for id in stale {
            state.conflicts.remove(&id);
        }

        let mut detected = Vec::new();
        let heads: Vec<PendingOperation<E>> = state.queue.heads().into_iter().cloned().collect();
        for op in heads {
            if state.conflicts.get(&op.entity_id).map(|c| c.operation_id == op.id).unwrap_or(false) {
                continue;
            }
            let Some(server) = state.store.server_entity(&op.entity_id).cloned() else {
                continue;
            };
            match self.inner.detector.evaluate(&op, &server) {
                Ok(Detection::Conflict(fields)) => {
                    let local = state.store.local_entity(&op.entity_id).cloned().unwrap_or_else(|| server.clone());
                    let info = self.inner.detector.build_conflict(&op, local, server, fields.clone());
                    warn!("🚨 [{}] 同步后检测到冲突: {} {:?}", self.inner.label, op.entity_id, fields);
                    effects.events.push(SyncEvent::ConflictDetected {
                        entity_id: op.entity_id.clone(),
                        operation_id: op.id.clone(),
                        fields,
                        timestamp: now_millis(),
                    });
                    state.conflicts.insert(op.entity_id.clone(), info.clone());
                    detected.push(info);
                }
                Ok(_) => {}
                Err(e) => warn!("⚠️ [{}] 冲突检测失败 {}: {}", self.inner.label, op.entity_id, e),
            }
        }
        detected
    }

    /// `sync_with_server` 的别名
    pub async fn refresh(&self) -> Result<()> {
        self.sync_with_server().await
    }

    /// 乐观创建
    ///
    /// 立即以临时 ID 出现在本地视图中；确认后临时 ID 被替换为服务端 ID，失败时回滚。
    pub async fn optimistic_create(&self, data: Patch) -> Result<Optimistic<E>> {
        if !self.inner.config.enable_optimistic_updates {
            let created = self.inner.call(self.inner.service.create(&data)).await?;
            let id = self.inner.service.extract_entity_id(&created);
            self.apply_direct_upsert(id.clone(), created.clone()).await;
            return Ok(Optimistic {
                entity: created.clone(),
                confirmation: Confirmation::ready(id, Ok(Some(created))),
            });
        }

        let temp_id = self.inner.service.temporary_id();
        let entity: E = entity::synthesize(&self.inner.config.id_field, &temp_id, &data)?;
        let op = PendingOperation::new(temp_id.clone(), OperationKind::Create, data, None);
        let (confirmation, waiter) = Confirmation::pending(op.id.clone(), temp_id.clone());

        self.enqueue(op, waiter).await;
        debug!("🆕 [{}] 乐观创建: {}", self.inner.label, temp_id);
        Ok(Optimistic { entity, confirmation })
    }

    /// 乐观更新
    pub async fn optimistic_update(&self, id: &EntityId, changes: Patch) -> Result<Optimistic<E>> {
        if !self.inner.config.enable_optimistic_updates {
            let updated = self.inner.call(self.inner.service.update(id, &changes)).await?;
            self.apply_direct_upsert(id.clone(), updated.clone()).await;
            return Ok(Optimistic {
                entity: updated.clone(),
                confirmation: Confirmation::ready(id.clone(), Ok(Some(updated))),
            });
        }

        let (op, entity) = {
            let state = self.inner.state.lock();
            let current = state
                .store
                .local_entity(id)
                .ok_or_else(|| RealtimeStateError::NotFound(format!("{} {}", self.inner.config.entity, id)))?;
            let preview = entity::apply_patch(current, &changes)?;
            let base = state.store.server_entity(id).cloned();
            (PendingOperation::new(id.clone(), OperationKind::Update, changes, base), preview)
        };
        let (confirmation, waiter) = Confirmation::pending(op.id.clone(), id.clone());

        self.enqueue(op, waiter).await;
        debug!("✏️ [{}] 乐观更新: {}", self.inner.label, id);
        Ok(Optimistic { entity, confirmation })
    }

    /// 乐观删除
    ///
    /// 尚未发出的创建操作会被直接撤销，不会产生远端请求。
    pub async fn optimistic_delete(&self, id: &EntityId) -> Result<Confirmation<E>> {
        if !self.inner.config.enable_optimistic_updates {
            self.inner.call(self.inner.service.delete(id)).await.or_else(|e| {
                if e.is_not_found() {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
            self.apply_direct_remove(id).await;
            return Ok(Confirmation::ready(id.clone(), Ok(None)));
        }

        let mut effects = Effects::default();
        let op = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.store.local_entity(id).is_none() {
                return Err(RealtimeStateError::NotFound(format!("{} {}", self.inner.config.entity, id)));
            }

            let unsent_create = state
                .queue
                .head(id)
                .map(|op| op.kind == OperationKind::Create && !op.is_in_flight())
                .unwrap_or(false);
            if unsent_create {
                for dropped in state.queue.drain_lane(id) {
                    self.inner.forget(&dropped.id);
                    effects.resolve(
                        state,
                        &dropped.id,
                        Err(RealtimeStateError::Cancelled(format!("{} deleted before sync", id))),
                    );
                    effects.events.push(SyncEvent::OperationCancelled {
                        operation_id: dropped.id.clone(),
                        entity_id: id.clone(),
                        timestamp: now_millis(),
                    });
                }
                state.recompute();
                effects.changed(state);
                None
            } else {
                let base = state.store.server_entity(id).cloned();
                Some(PendingOperation::new(id.clone(), OperationKind::Delete, Patch::new(), base))
            }
        };

        match op {
            None => {
                self.inner.apply(effects).await;
                debug!("🗑️ [{}] 撤销未同步的创建: {}", self.inner.label, id);
                Ok(Confirmation::ready(id.clone(), Ok(None)))
            }
            Some(op) => {
                let (confirmation, waiter) = Confirmation::pending(op.id.clone(), id.clone());
                self.enqueue(op, waiter).await;
                debug!("🗑️ [{}] 乐观删除: {}", self.inner.label, id);
                Ok(confirmation)
            }
        }
    }

    /// 批量乐观更新
    ///
    /// 每一项独立入队、独立回滚；全部确认后按输入顺序返回服务端版本，
    /// 任意一项失败时返回按输入顺序的第一个错误。
    pub async fn optimistic_update_many(&self, updates: Vec<(EntityId, Patch)>) -> Result<Vec<E>> {
        let total = updates.len();
        let mut staged = Vec::with_capacity(total);
        for (id, changes) in updates {
            let confirmation = self.optimistic_update(&id, changes).await.map(|o| o.confirmation);
            staged.push((id, confirmation));
        }

        let results = join_all(staged.into_iter().map(|(id, confirmation)| async move {
            match confirmation {
                Ok(confirmation) => match confirmation.confirmed().await {
                    Ok(Some(entity)) => Ok(entity),
                    Ok(None) => Err(RealtimeStateError::NotFound(format!("{} was deleted", id))),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        }))
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!("⚠️ [{}] 批量更新 {} 项中 {} 项失败", self.inner.label, total, failed);
        } else {
            debug!("✅ [{}] 批量更新 {} 项已确认", self.inner.label, total);
        }
        results.into_iter().collect()
    }

    async fn enqueue(&self, op: PendingOperation<E>, waiter: Waiter<E>) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let operation_id = op.id.clone();
            let entity_id = op.entity_id.clone();
            let kind = op.kind;

            state.queue.enqueue(op);
            if let Some(queued) = state.queue.find(&operation_id) {
                self.inner.persist(queued);
            }
            state.waiters.insert(operation_id.clone(), waiter);
            state.recompute();

            effects.events.push(SyncEvent::OperationEnqueued {
                operation_id,
                entity_id: entity_id.clone(),
                kind,
                timestamp: now_millis(),
            });
            effects.changed(state);
            effects.schedule.push(entity_id);
        }
        self.inner.apply(effects).await;
    }

    async fn apply_direct_upsert(&self, id: EntityId, entity: E) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.store.upsert_server(id, entity);
            state.recompute();
            effects.changed(state);
        }
        self.inner.apply(effects).await;
    }

    async fn apply_direct_remove(&self, id: &EntityId) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.store.remove_server(id);
            state.locks.remove(id);
            state.recompute();
            effects.changed(state);
        }
        self.inner.apply(effects).await;
    }

    // ========== 查询 ==========

    /// 本地视图（含未确认修改）
    pub fn local_state(&self) -> Vec<E> {
        self.inner.state.lock().store.local_state()
    }

    /// 最近一次服务端确认的快照
    pub fn server_state(&self) -> Vec<E> {
        self.inner.state.lock().store.server_state()
    }

    pub fn get_entity(&self, id: &EntityId) -> Option<E> {
        self.inner.state.lock().store.local_entity(id).cloned()
    }

    /// 本地视图中满足条件的实体
    pub fn find_where<F>(&self, predicate: F) -> Vec<E>
    where
        F: Fn(&E) -> bool,
    {
        self.inner
            .state
            .lock()
            .store
            .local_state()
            .into_iter()
            .filter(|entity| predicate(entity))
            .collect()
    }

    /// 本地视图是否已超过缓存有效期；未启用缓存时总是过期
    pub fn is_cache_stale(&self) -> bool {
        if !self.inner.config.enable_caching {
            return true;
        }
        match self.inner.state.lock().last_cache_update {
            Some(updated) => updated.elapsed() > self.inner.config.cache_ttl(),
            None => true,
        }
    }

    /// 所有待同步操作，按发起顺序
    pub fn pending_operations(&self) -> Vec<PendingOperation<E>> {
        self.inner.state.lock().queue.operations()
    }

    pub fn failed_operations(&self) -> Vec<FailedOperation<E>> {
        self.inner.state.lock().queue.failed()
    }

    pub fn clear_failed_operations(&self) {
        self.inner.state.lock().queue.clear_failed();
    }

    pub fn conflicts(&self) -> Vec<ConflictInfo<E>> {
        self.inner.state.lock().conflicts.values().cloned().collect()
    }

    pub fn conflict_for(&self, id: &EntityId) -> Option<ConflictInfo<E>> {
        self.inner.state.lock().conflicts.get(id).cloned()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.state.lock().status
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().last_sync
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    /// 实时通道是否已连接
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection.clone()
    }

    pub fn entity_locks(&self) -> Vec<EntityLock> {
        self.inner.state.lock().locks.values().cloned().collect()
    }

    /// 实体当前的锁（仅提示）
    pub fn lock_for(&self, id: &EntityId) -> Option<EntityLock> {
        self.inner.state.lock().locks.get(id).cloned()
    }

    pub fn bulk_operations(&self) -> Vec<BulkOperation> {
        self.inner.state.lock().bulk.values().cloned().collect()
    }

    /// 正在同步或有批量操作进行中
    pub fn is_loading(&self) -> bool {
        let state = self.inner.state.lock();
        state.status == SyncStatus::Syncing || !state.bulk.is_empty()
    }

    /// 本地视图与服务端快照是否不同
    pub fn has_changes(&self) -> bool {
        let state = self.inner.state.lock();
        has_changes(&state)
    }

    pub fn has_conflicts(&self) -> bool {
        !self.inner.state.lock().conflicts.is_empty()
    }

    pub fn has_pending_operations(&self) -> bool {
        !self.inner.state.lock().queue.is_empty()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.state.lock().queue.stats()
    }

    pub fn get_sync_stats(&self) -> SyncStats {
        let state = self.inner.state.lock();
        SyncStats {
            local_count: state.store.local_len(),
            server_count: state.store.server_len(),
            conflict_count: state.conflicts.len(),
            pending_count: state.queue.len(),
            failed_count: state.queue.failed_len(),
            last_sync: state.last_sync,
            status: state.status,
            is_connected: state.connection.is_connected(),
            has_changes: has_changes(&state),
        }
    }

    // ========== 订阅 ==========

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.inner.events.subscribe_filtered(filter)
    }

    /// 订阅状态快照（最新值语义）
    pub fn subscribe_state(&self) -> watch::Receiver<StateSnapshot<E>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// 按事件类型注册监听器，`*` 接收所有事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_listener(event_type, listener).await;
    }

    pub async fn event_stats(&self) -> EventStats {
        self.inner.events.get_stats().await
    }

    // ========== 维护 ==========

    /// 清空所有状态；未完成的确认以 `Cancelled` 结束
    pub async fn reset(&self) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.epoch += 1;
            state.queue.clear();
            state.queue.clear_failed();
            state.store.clear();
            state.conflicts.clear();
            state.locks.clear();
            state.bulk.clear();
            state.running.clear();
            state.held_echoes.clear();
            state.status = SyncStatus::Idle;
            state.last_error = None;
            state.last_sync = None;
            state.initialized = false;
            for (_, waiter) in state.waiters.drain() {
                effects
                    .resolved
                    .push((waiter, Err(RealtimeStateError::Cancelled("state manager reset".to_string()))));
            }
            effects.changed(state);
            state.last_cache_update = None;
        }
        if let Some(journal) = &self.inner.journal {
            if let Err(e) = journal.clear() {
                error!("❌ [{}] 清空操作日志失败: {}", self.inner.label, e);
            }
        }
        self.inner.dedup.clear();
        self.inner.apply(effects).await;
        info!("🧹 [{}] 状态已重置", self.inner.label);
    }

    /// 丢弃所有未解决的冲突，对应的操作以当前服务端版本为基础继续提交
    pub async fn clear_conflicts(&self) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let cleared: Vec<EntityId> = state.conflicts.drain().map(|(id, _)| id).collect();
            for id in cleared {
                let server = state.store.server_entity(&id).cloned();
                if let Some(head) = state.queue.head_mut(&id) {
                    if head.kind != OperationKind::Create && server.is_some() {
                        head.base = server;
                    }
                    let head = head.clone();
                    self.inner.persist(&head);
                }
                effects.events.push(SyncEvent::ConflictResolved {
                    entity_id: id.clone(),
                    resolution: "cleared".to_string(),
                    timestamp: now_millis(),
                });
                effects.schedule.push(id);
            }
            effects.changed(state);
        }
        self.inner.apply(effects).await;
    }

    /// 取消所有待同步操作并回滚本地修改
    ///
    /// 已经发出的请求无法撤回，其结果到达后作为服务端版本写入快照。
    pub async fn cancel_pending_operations(&self) -> usize {
        let mut effects = Effects::default();
        let cancelled = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let ops = state.queue.clear();
            for op in &ops {
                self.inner.forget(&op.id);
                effects.resolve(
                    state,
                    &op.id,
                    Err(RealtimeStateError::Cancelled("pending operations cancelled".to_string())),
                );
                effects.events.push(SyncEvent::OperationCancelled {
                    operation_id: op.id.clone(),
                    entity_id: op.entity_id.clone(),
                    timestamp: now_millis(),
                });
            }
            state.conflicts.clear();
            state.recompute();
            effects.changed(state);
            ops.len()
        };
        self.inner.apply(effects).await;
        info!("🚫 [{}] 已取消 {} 个待同步操作", self.inner.label, cancelled);
        cancelled
    }

    /// 跳过退避等待，立即派发所有可派发的操作
    pub async fn force_push(&self) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let now = now_millis();
            let heads: Vec<EntityId> = state.queue.heads().iter().map(|op| op.entity_id.clone()).collect();
            for id in &heads {
                if let Some(head) = state.queue.head_mut(id) {
                    if !head.is_in_flight() {
                        head.next_retry_at = Some(now);
                    }
                }
            }
            effects.schedule = heads;
        }
        self.inner.apply(effects).await;
        info!("⏩ [{}] 强制推送待同步操作", self.inner.label);
    }
}

/// 本地视图只由服务端快照和待同步操作推导，队列为空时两者一致
fn has_changes<E: Entity>(state: &ManagerState<E>) -> bool {
    !state.queue.is_empty()
}
