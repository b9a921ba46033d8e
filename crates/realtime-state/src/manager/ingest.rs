//! 实时事件接入
//!
//! 推送通道的事件在这里写入服务端快照。事件是幂等的：内容相同的载荷、
//! 重复的 `event_id` 都会被忽略。有活跃操作的实体先经过冲突检测。

use tracing::{debug, info, instrument, warn};

use super::{Effects, ManagerState, RealtimeStateManager};
use crate::connection_state::ConnectionStatus;
use crate::entity::{self, Entity, EntityId, Patch};
use crate::error::{RealtimeStateError, Result};
use crate::events::{now_millis, SyncEvent};
use crate::storage::{FailedOperation, FailureReason, OperationKind, OperationStatus, PendingOperation};
use crate::sync::{
    BulkCompletion, BulkOperation, BulkProgress, ConflictDecision, ConflictInfo, ConflictResolution, Detection,
    EntityLock, RealtimeEnvelope, RealtimeMessage,
};

/// 冲突解决方案在锁内的执行计划
enum Plan {
    AcceptServer,
    AcceptLocal,
    Merge(Patch),
}

impl<E: Entity> RealtimeStateManager<E> {
    /// 其他客户端创建了实体（或我们自己创建的回声）
    pub async fn on_entity_created(&self, entity: E) -> Result<()> {
        self.ingest_upsert(entity, "created").await
    }

    pub async fn on_entity_updated(&self, entity: E) -> Result<()> {
        self.ingest_upsert(entity, "updated").await
    }

    async fn ingest_upsert(&self, incoming: E, action: &'static str) -> Result<()> {
        let id = self.inner.service.extract_entity_id(&incoming);
        let mut effects = Effects::default();

        // None 表示事件被忽略（载荷未变化或暂扣为创建回声）
        let outcome = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let echo_of = self.pending_create_for(state, &id, &incoming)?;
            let unchanged = match state.store.server_entity(&id) {
                Some(current) => entity::same_content(current, &incoming, &[])?,
                None => false,
            };
            if let Some(operation_id) = echo_of {
                // 创建结果返回前不写入快照，避免临时 ID 的行之外再出现一份
                debug!("⏳ [{}] 暂扣在途创建的回声: {} (操作 {})", self.inner.label, id, operation_id);
                state.held_echoes.insert(operation_id, incoming.clone());
                state.connection.record_event(false);
                effects.events.push(SyncEvent::ServerEventIgnored {
                    entity_id: Some(id.clone()),
                    reason: "echo of pending create".to_string(),
                    timestamp: now_millis(),
                });
                None
            } else if unchanged {
                state.connection.record_event(false);
                effects.events.push(SyncEvent::ServerEventIgnored {
                    entity_id: Some(id.clone()),
                    reason: "unchanged".to_string(),
                    timestamp: now_millis(),
                });
                None
            } else {
                let mut conflict = None;
                if let Some(head) = state.queue.head(&id).cloned() {
                    match self.inner.detector.evaluate(&head, &incoming)? {
                        Detection::Conflict(fields) => {
                            let local = state.store.local_entity(&id).cloned().unwrap_or_else(|| incoming.clone());
                            let info = self.inner.detector.build_conflict(&head, local, incoming.clone(), fields.clone());
                            warn!("🚨 [{}] 检测到冲突: {} 字段 {:?}", self.inner.label, id, fields);
                            effects.events.push(SyncEvent::ConflictDetected {
                                entity_id: id.clone(),
                                operation_id: head.id.clone(),
                                fields,
                                timestamp: now_millis(),
                            });
                            state.conflicts.insert(id.clone(), info.clone());
                            conflict = Some(info);
                        }
                        Detection::Echo => debug!("🔁 [{}] 收到自己写入的回声: {}", self.inner.label, id),
                        Detection::Unchanged | Detection::NotApplicable => {}
                    }
                }

                state.store.upsert_server(id.clone(), incoming.clone());
                state.recompute();
                state.connection.record_event(true);
                effects.events.push(SyncEvent::RemoteChangeApplied {
                    entity_id: id.clone(),
                    action: action.to_string(),
                    timestamp: now_millis(),
                });
                effects.changed(state);
                Some(conflict)
            }
        };
        self.inner.apply(effects).await;
        let Some(conflict) = outcome else {
            debug!("♻️ [{}] 忽略推送: {}", self.inner.label, id);
            return Ok(());
        };
        debug!("📥 [{}] 应用远端{}: {}", self.inner.label, action, id);

        let hook_result = if action == "created" {
            self.inner.hooks.notify_entity_created(&incoming).await
        } else {
            self.inner.hooks.notify_entity_updated(&incoming).await
        };
        if let Err(e) = hook_result {
            warn!("⚠️ [{}] 实体回调失败: {}", self.inner.label, e);
        }

        if let Some(conflict) = conflict {
            self.decide_conflict(conflict).await;
        }
        Ok(())
    }

    /// 推送的实体是否是某个在途创建的回声
    ///
    /// 只匹配服务端快照和队列里都没有的 ID，且实体包含创建载荷的全部字段。
    fn pending_create_for(&self, state: &ManagerState<E>, id: &EntityId, incoming: &E) -> Result<Option<String>> {
        if state.store.server_entity(id).is_some() || state.queue.has_pending(id) {
            return Ok(None);
        }
        if state.held_echoes.values().any(|e| &self.inner.service.extract_entity_id(e) == id) {
            return Ok(None);
        }
        for head in state.queue.heads() {
            if head.kind != OperationKind::Create
                || !head.is_in_flight()
                || state.held_echoes.contains_key(&head.id)
            {
                continue;
            }
            if entity::matches_payload(incoming, &head.payload, &self.inner.config.id_field)? {
                return Ok(Some(head.id.clone()));
            }
        }
        Ok(None)
    }

    /// 询问观察者如何处理冲突，没有观察者决定时采用服务端版本
    pub(super) async fn decide_conflict(&self, conflict: ConflictInfo<E>) {
        let decision = match self.inner.hooks.decide_conflict(&conflict).await {
            Some(decision) => decision,
            None => {
                warn!(
                    "⚠️ [{}] 冲突无人处理，默认采用服务端版本: {} {:?}",
                    self.inner.label, conflict.entity_id, conflict.conflicted_fields
                );
                ConflictDecision::AcceptServer
            }
        };

        match decision.into_resolution::<E>() {
            Some(resolution) => {
                if let Err(e) = self.resolve_conflict(&conflict.entity_id, resolution).await {
                    warn!("⚠️ [{}] 自动解决冲突失败 {}: {}", self.inner.label, conflict.entity_id, e);
                }
            }
            None => info!("⏸️ [{}] 冲突保留待处理: {}", self.inner.label, conflict.entity_id),
        }
    }

    /// 解决实体上的冲突
    #[instrument(skip(self, resolution), fields(feature = %self.inner.label, resolution = resolution.name()))]
    pub async fn resolve_conflict(&self, entity_id: &EntityId, resolution: ConflictResolution<E>) -> Result<()> {
        let name = resolution.name();
        let conflict = self
            .inner
            .state
            .lock()
            .conflicts
            .get(entity_id)
            .cloned()
            .ok_or_else(|| RealtimeStateError::NotFound(format!("no open conflict for {}", entity_id)))?;

        // 合并函数由调用方提供，在锁外执行
        let plan = match resolution {
            ConflictResolution::AcceptServer => Plan::AcceptServer,
            ConflictResolution::AcceptLocal => Plan::AcceptLocal,
            ConflictResolution::Merge(merge) => Plan::Merge(merge(&conflict)),
        };

        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let still_open = state
                .conflicts
                .get(entity_id)
                .map(|c| c.operation_id == conflict.operation_id)
                .unwrap_or(false);
            if !still_open {
                return Err(RealtimeStateError::NotFound(format!("conflict for {} already resolved", entity_id)));
            }
            let kind = state.queue.find(&conflict.operation_id).map(|op| op.kind);
            if matches!(plan, Plan::Merge(_)) && kind == Some(OperationKind::Delete) {
                return Err(RealtimeStateError::InvalidOperation(format!(
                    "cannot merge into a pending delete of {}",
                    entity_id
                )));
            }
            state.conflicts.remove(entity_id);

            let server = state.store.server_entity(entity_id).cloned();
            match plan {
                Plan::AcceptServer => {
                    if let Some(dropped) = state.queue.remove_operation(&conflict.operation_id) {
                        self.inner.forget(&dropped.id);
                        effects.resolve(
                            state,
                            &dropped.id,
                            Err(RealtimeStateError::Conflict(format!("{} was changed on the server", entity_id))),
                        );
                        effects.events.push(SyncEvent::OperationCancelled {
                            operation_id: dropped.id.clone(),
                            entity_id: entity_id.clone(),
                            timestamp: now_millis(),
                        });
                        if let Some(promoted) = state.queue.promote(entity_id, server).cloned() {
                            self.inner.persist(&promoted);
                        }
                    }
                }
                Plan::AcceptLocal => {
                    if let Some(op) = state.queue.find_mut(&conflict.operation_id) {
                        op.base = server;
                        op.next_retry_at = Some(now_millis());
                        let op = op.clone();
                        self.inner.persist(&op);
                    }
                }
                Plan::Merge(patch) => {
                    if let Some(op) = state.queue.find_mut(&conflict.operation_id) {
                        op.kind = OperationKind::Update;
                        op.payload = patch;
                        op.base = server;
                        op.next_retry_at = Some(now_millis());
                        let op = op.clone();
                        self.inner.persist(&op);
                    }
                }
            }

            state.recompute();
            effects.events.push(SyncEvent::ConflictResolved {
                entity_id: entity_id.clone(),
                resolution: name.to_string(),
                timestamp: now_millis(),
            });
            effects.changed(state);
            effects.schedule.push(entity_id.clone());
        }
        self.inner.apply(effects).await;
        info!("🤝 [{}] 冲突已解决 ({}): {}", self.inner.label, name, entity_id);
        Ok(())
    }

    /// 实体在服务端被删除
    ///
    /// 未发出的删除操作视为已完成；其他未发出的操作以 `NotFound` 失败。
    pub async fn on_entity_deleted(&self, entity_id: &EntityId) -> Result<()> {
        let mut effects = Effects::default();
        let mut failed = Vec::new();
        let existed = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let existed = state.store.remove_server(entity_id).is_some();
            let mut changed = existed;
            let service = &self.inner.service;
            state.held_echoes.retain(|_, held| &service.extract_entity_id(held) != entity_id);

            let lane: Vec<PendingOperation<E>> = state
                .queue
                .ordered()
                .into_iter()
                .filter(|op| &op.entity_id == entity_id && !op.is_in_flight())
                .cloned()
                .collect();
            for op in lane {
                changed = true;
                state.queue.remove_operation(&op.id);
                self.inner.forget(&op.id);
                if op.kind == OperationKind::Delete {
                    effects.resolve(state, &op.id, Ok(None));
                    effects.events.push(SyncEvent::OperationConfirmed {
                        operation_id: op.id.clone(),
                        entity_id: entity_id.clone(),
                        kind: op.kind,
                        timestamp: now_millis(),
                    });
                } else {
                    let error = RealtimeStateError::NotFound(format!("{} was deleted on the server", entity_id));
                    effects.resolve(state, &op.id, Err(error.clone()));
                    effects.events.push(SyncEvent::OperationFailed {
                        operation_id: op.id.clone(),
                        entity_id: entity_id.clone(),
                        kind: op.kind,
                        error: error.to_string(),
                        timestamp: now_millis(),
                    });
                    let mut operation = op;
                    operation.status = OperationStatus::Failed;
                    operation.last_error = Some(error.to_string());
                    let record = FailedOperation {
                        operation,
                        error,
                        reason: FailureReason::NotFound,
                        failed_at: chrono::Utc::now(),
                    };
                    state.queue.record_failure(record.clone());
                    failed.push(record);
                }
            }

            changed |= state.conflicts.remove(entity_id).is_some();
            changed |= state.locks.remove(entity_id).is_some();

            if changed {
                state.recompute();
                state.connection.record_event(true);
                effects.events.push(SyncEvent::RemoteChangeApplied {
                    entity_id: entity_id.clone(),
                    action: "deleted".to_string(),
                    timestamp: now_millis(),
                });
                effects.changed(state);
            } else {
                state.connection.record_event(false);
                effects.events.push(SyncEvent::ServerEventIgnored {
                    entity_id: Some(entity_id.clone()),
                    reason: "unknown entity".to_string(),
                    timestamp: now_millis(),
                });
            }
            existed
        };
        self.inner.apply(effects).await;

        if existed {
            debug!("📥 [{}] 应用远端删除: {}", self.inner.label, entity_id);
            if let Err(e) = self.inner.hooks.notify_entity_deleted(entity_id).await {
                warn!("⚠️ [{}] on_entity_deleted 回调失败: {}", self.inner.label, e);
            }
        }
        for record in &failed {
            if let Err(e) = self.inner.hooks.notify_operation_failed(record).await {
                warn!("⚠️ [{}] on_operation_failed 回调失败: {}", self.inner.label, e);
            }
        }
        Ok(())
    }

    // ========== 连接 ==========

    /// 推送通道已连接：补拉快照，然后推送积压的操作
    ///
    /// 同步失败会记录在状态中并返回，积压操作仍然会被推送。
    pub async fn on_realtime_connected(&self) -> Result<()> {
        let (old_status, reconnect) = {
            let mut state = self.inner.state.lock();
            let old_status = state.connection.status;
            (old_status, state.connection.mark_connected())
        };
        self.set_connection_status(old_status, ConnectionStatus::Connected).await;
        if reconnect {
            info!("🔗 [{}] 推送通道已重连", self.inner.label);
        } else {
            info!("🔗 [{}] 推送通道已连接", self.inner.label);
        }
        if let Err(e) = self.inner.hooks.notify_connection_changed(true).await {
            warn!("⚠️ [{}] on_connection_changed 回调失败: {}", self.inner.label, e);
        }

        let result = self.sync_with_server().await;
        if let Err(e) = &result {
            warn!("⚠️ [{}] 重连后同步失败，继续推送积压操作: {}", self.inner.label, e);
        }
        self.drain_queue();
        result
    }

    /// 推送通道断开：操作继续排队，暂停远端派发
    pub async fn on_realtime_disconnected(&self) {
        let old_status = {
            let mut state = self.inner.state.lock();
            let old_status = state.connection.status;
            state.connection.mark_disconnected();
            old_status
        };
        let new_status = self.inner.state.lock().connection.status;
        self.set_connection_status(old_status, new_status).await;
        // 正在等待的通道醒来后发现离线并退出
        self.inner.wake.notify_waiters();
        warn!("🔌 [{}] 推送通道已断开", self.inner.label);
        if let Err(e) = self.inner.hooks.notify_connection_changed(false).await {
            warn!("⚠️ [{}] on_connection_changed 回调失败: {}", self.inner.label, e);
        }
    }

    async fn set_connection_status(&self, old_status: ConnectionStatus, new_status: ConnectionStatus) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            effects.events.push(SyncEvent::ConnectionStateChanged {
                old_status,
                new_status,
                timestamp: now_millis(),
            });
            effects.snapshot = Some(state.snapshot());
        }
        self.inner.apply(effects).await;
    }

    fn drain_queue(&self) {
        let heads: Vec<EntityId> = {
            let state = self.inner.state.lock();
            state.queue.heads().iter().map(|op| op.entity_id.clone()).collect()
        };
        for entity_id in heads {
            self.inner.schedule(entity_id);
        }
        self.inner.wake.notify_waiters();
    }

    // ========== 批量操作 ==========

    pub async fn on_bulk_operation_started(&self, operation: BulkOperation) {
        let total = operation.total;
        let operation_id = operation.operation_id.clone();
        self.inner.state.lock().bulk.insert(operation_id.clone(), operation.clone());
        info!("📦 [{}] 批量操作开始: {} (total={:?})", self.inner.label, operation_id, total);
        self.inner
            .events
            .emit(SyncEvent::BulkOperationStarted {
                operation_id,
                total,
                timestamp: now_millis(),
            })
            .await;
        if let Err(e) = self.inner.hooks.notify_bulk_started(&operation).await {
            warn!("⚠️ [{}] on_bulk_operation_started 回调失败: {}", self.inner.label, e);
        }
    }

    pub async fn on_bulk_operation_progress(&self, progress: BulkProgress) {
        let processed = progress.processed();
        {
            let mut state = self.inner.state.lock();
            if let (Some(tracked), Some(processed)) = (state.bulk.get_mut(&progress.operation_id), processed) {
                tracked.processed = processed;
            }
        }
        debug!("📦 [{}] 批量操作进度: {} {:?}", self.inner.label, progress.operation_id, processed);
        self.inner
            .events
            .emit(SyncEvent::BulkOperationProgress {
                operation_id: progress.operation_id.clone(),
                processed,
                timestamp: now_millis(),
            })
            .await;
        if let Err(e) = self.inner.hooks.notify_bulk_progress(&progress).await {
            warn!("⚠️ [{}] on_bulk_operation_progress 回调失败: {}", self.inner.label, e);
        }
    }

    /// 批量操作完成后服务端数据整体变化，重新拉取快照
    pub async fn on_bulk_operation_completed(&self, completion: BulkCompletion) -> Result<()> {
        self.inner.state.lock().bulk.remove(&completion.operation_id);
        info!("📦 [{}] 批量操作完成: {}", self.inner.label, completion.operation_id);
        self.inner
            .events
            .emit(SyncEvent::BulkOperationCompleted {
                operation_id: completion.operation_id.clone(),
                timestamp: now_millis(),
            })
            .await;
        if let Err(e) = self.inner.hooks.notify_bulk_completed(&completion).await {
            warn!("⚠️ [{}] on_bulk_operation_completed 回调失败: {}", self.inner.label, e);
        }
        self.sync_with_server().await
    }

    // ========== 实体锁（仅提示） ==========

    pub async fn on_entity_locked(&self, lock: EntityLock) {
        self.inner.state.lock().locks.insert(lock.entity_id.clone(), lock.clone());
        debug!("🔒 [{}] {} 被 {} 锁定", self.inner.label, lock.entity_id, lock.user_id);
        self.inner
            .events
            .emit(SyncEvent::EntityLocked {
                entity_id: lock.entity_id.clone(),
                user_id: lock.user_id.clone(),
                lock_type: lock.lock_type.clone(),
                timestamp: now_millis(),
            })
            .await;
        if let Err(e) = self.inner.hooks.notify_entity_locked(&lock).await {
            warn!("⚠️ [{}] on_entity_locked 回调失败: {}", self.inner.label, e);
        }
    }

    pub async fn on_entity_unlocked(&self, entity_id: &EntityId, user_id: &str) {
        self.inner.state.lock().locks.remove(entity_id);
        debug!("🔓 [{}] {} 被 {} 解锁", self.inner.label, entity_id, user_id);
        self.inner
            .events
            .emit(SyncEvent::EntityUnlocked {
                entity_id: entity_id.clone(),
                user_id: user_id.to_string(),
                timestamp: now_millis(),
            })
            .await;
        if let Err(e) = self.inner.hooks.notify_entity_unlocked(entity_id, user_id).await {
            warn!("⚠️ [{}] on_entity_unlocked 回调失败: {}", self.inner.label, e);
        }
    }

    // ========== 推送消息 ==========

    /// 处理推送通道收到的原始消息
    ///
    /// 带 `event_id` 的消息按 ID 去重；无法解析的消息返回 `Err`。
    pub async fn handle_realtime_message(&self, envelope: RealtimeEnvelope) -> Result<()> {
        if let Some(event_id) = envelope.event_id.as_deref() {
            if self.inner.dedup.check_and_mark(event_id) {
                self.inner.state.lock().connection.record_duplicate();
                debug!("♻️ [{}] 重复事件已丢弃: {}", self.inner.label, event_id);
                self.inner
                    .events
                    .emit(SyncEvent::ServerEventIgnored {
                        entity_id: None,
                        reason: format!("duplicate event {}", event_id),
                        timestamp: now_millis(),
                    })
                    .await;
                return Ok(());
            }
        }

        let message = match envelope.into_message::<E>(&self.inner.config.id_field) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ [{}] 无法解析推送消息: {}", self.inner.label, e);
                self.inner
                    .events
                    .emit(SyncEvent::ServerEventIgnored {
                        entity_id: None,
                        reason: e.to_string(),
                        timestamp: now_millis(),
                    })
                    .await;
                return Err(e);
            }
        };

        debug!("📨 [{}] 推送消息: {}", self.inner.label, message.action());
        match message {
            RealtimeMessage::Created(entity) => self.on_entity_created(entity).await,
            RealtimeMessage::Updated(entity) => self.on_entity_updated(entity).await,
            RealtimeMessage::Deleted(entity_id) => self.on_entity_deleted(&entity_id).await,
            RealtimeMessage::BulkStarted(operation) => {
                self.on_bulk_operation_started(operation).await;
                Ok(())
            }
            RealtimeMessage::BulkProgress(progress) => {
                self.on_bulk_operation_progress(progress).await;
                Ok(())
            }
            RealtimeMessage::BulkCompleted(completion) => self.on_bulk_operation_completed(completion).await,
            RealtimeMessage::LockAcquired(lock) => {
                self.on_entity_locked(lock).await;
                Ok(())
            }
            RealtimeMessage::LockReleased(release) => {
                self.on_entity_unlocked(&release.entity_id, &release.user_id).await;
                Ok(())
            }
            RealtimeMessage::Connected => self.on_realtime_connected().await,
            RealtimeMessage::Disconnected => {
                self.on_realtime_disconnected().await;
                Ok(())
            }
        }
    }
}
