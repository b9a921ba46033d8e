//! 通道派发
//!
//! 每个有待同步操作的实体最多有一个后台任务，按 FIFO 逐个派发通道头部。
//! 不同实体的任务并发运行，由信号量限制同时进行的远端请求数。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{Effects, Inner, ManagerState};
use crate::entity::{Entity, EntityId};
use crate::error::RealtimeStateError;
use crate::events::{now_millis, SyncEvent};
use crate::storage::{FailedOperation, FailureReason, OperationKind, OperationStatus, PendingOperation, RetryDecision};

/// 一次派发之后通道的去向
enum LaneNext {
    /// 继续处理该通道（创建确认后可能换成服务端 ID）
    Continue(EntityId),
    Stop,
}

impl<E: Entity> Inner<E> {
    /// 确保实体通道有后台任务在运行
    pub(super) fn schedule(self: &Arc<Self>, entity_id: EntityId) {
        let epoch = {
            let mut state = self.state.lock();
            if !state.queue.has_pending(&entity_id) {
                return;
            }
            if !state.running.insert(entity_id.clone()) {
                return;
            }
            state.epoch
        };
        debug!("▶️ [{}] 启动通道: {}", self.label, entity_id);
        let inner = self.clone();
        tokio::spawn(async move {
            inner.run_lane(entity_id, epoch).await;
        });
    }

    async fn run_lane(self: Arc<Self>, mut entity_id: EntityId, epoch: u64) {
        let debounce_ms = self.config.debounce_ms as i64;
        loop {
            let woken = self.wake.notified();
            // 通道阻塞（离线、冲突未解决）或为空时退出，由重连/解决冲突重新调度
            let ready_at = {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    return;
                }
                let blocked = !state.connection.is_online() || state.conflicts.contains_key(&entity_id);
                match state.queue.head(&entity_id) {
                    Some(head) if !blocked && !head.is_in_flight() => {
                        head.next_retry_at.unwrap_or(head.created_at + debounce_ms)
                    }
                    _ => {
                        state.running.remove(&entity_id);
                        return;
                    }
                }
            };

            let wait = ready_at - now_millis();
            if wait > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
                    _ = woken => {}
                }
                continue;
            }

            let Ok(permit) = self.permits.acquire().await else {
                self.state.lock().running.remove(&entity_id);
                return;
            };

            let op = {
                let mut state = self.state.lock();
                if state.epoch != epoch {
                    return;
                }
                if !state.connection.is_online() || state.conflicts.contains_key(&entity_id) {
                    continue;
                }
                let Some(head) = state.queue.head_mut(&entity_id) else {
                    continue;
                };
                head.status = OperationStatus::InFlight;
                head.attempts += 1;
                head.clone()
            };

            self.events
                .emit(SyncEvent::OperationDispatched {
                    operation_id: op.id.clone(),
                    entity_id: op.entity_id.clone(),
                    kind: op.kind,
                    attempt: op.attempts,
                    timestamp: now_millis(),
                })
                .await;
            debug!("📤 [{}] 派发 {} {} (第 {} 次)", self.label, op.kind, op.entity_id, op.attempts);

            let result = self.dispatch(&op).await;
            drop(permit);

            let next = match result {
                Ok(server) => self.on_confirmed(op, server, epoch).await,
                Err(e) => self.on_failed(op, e, epoch).await,
            };
            match next {
                LaneNext::Continue(id) => entity_id = id,
                LaneNext::Stop => return,
            }
        }
    }

    async fn dispatch(&self, op: &PendingOperation<E>) -> crate::error::Result<Option<E>> {
        match op.kind {
            OperationKind::Create => self.call(self.service.create(&op.payload)).await.map(Some),
            OperationKind::Update => self.call(self.service.update(&op.entity_id, &op.payload)).await.map(Some),
            OperationKind::Delete => match self.call(self.service.delete(&op.entity_id)).await {
                Ok(()) => Ok(None),
                Err(e) if e.is_not_found() => {
                    debug!("🗑️ [{}] 删除目标已不存在，视为成功: {}", self.label, op.entity_id);
                    Ok(None)
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn on_confirmed(self: &Arc<Self>, op: PendingOperation<E>, server: Option<E>, epoch: u64) -> LaneNext {
        let mut effects = Effects::default();
        let (next, confirmed) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.epoch != epoch {
                return LaneNext::Stop;
            }

            let queued = state.queue.find(&op.id).is_some();
            let mut lane = op.entity_id.clone();
            let mut owns_lane = true;

            match (op.kind, &server) {
                (OperationKind::Delete, _) => {
                    state.store.remove_server(&op.entity_id);
                    state.locks.remove(&op.entity_id);
                }
                (_, Some(entity)) => {
                    let server_id = self.service.extract_entity_id(entity);
                    if op.kind == OperationKind::Create && server_id != op.entity_id && queued {
                        state.queue.rekey(&op.entity_id, &server_id);
                        if let Some(conflict) = state.conflicts.remove(&op.entity_id) {
                            state.conflicts.insert(server_id.clone(), conflict);
                        }
                        state.running.remove(&op.entity_id);
                        owns_lane = state.running.insert(server_id.clone());
                        effects.events.push(SyncEvent::TemporaryIdReplaced {
                            temporary_id: op.entity_id.clone(),
                            server_id: server_id.clone(),
                            timestamp: now_millis(),
                        });
                        info!("🔁 [{}] 临时 ID 已替换: {} -> {}", self.label, op.entity_id, server_id);
                        lane = server_id.clone();
                    }
                    state.store.upsert_server(server_id, entity.clone());
                }
                (_, None) => {}
            }

            // 暂扣的推送不是这次创建的回声时，补写回服务端快照
            if let Some(held) = state.held_echoes.remove(&op.id) {
                let held_id = self.service.extract_entity_id(&held);
                let confirmed_id = server.as_ref().map(|e| self.service.extract_entity_id(e));
                if confirmed_id.as_ref() != Some(&held_id) {
                    self.restore_echo(state, held_id, held);
                }
            }

            if queued {
                state.queue.remove_operation(&op.id);
                self.forget(&op.id);

                let superseded = state
                    .conflicts
                    .get(&lane)
                    .map(|c| c.operation_id == op.id)
                    .unwrap_or(false);
                if superseded {
                    state.conflicts.remove(&lane);
                    effects.events.push(SyncEvent::ConflictResolved {
                        entity_id: lane.clone(),
                        resolution: "superseded".to_string(),
                        timestamp: now_millis(),
                    });
                }

                let server_version = state.store.server_entity(&lane).cloned();
                let promoted = state.queue.promote(&lane, server_version).cloned();
                // 通道里剩余的操作 entity_id 可能已被迁移，整体重写日志
                let remaining: Vec<PendingOperation<E>> =
                    state.queue.ordered().into_iter().filter(|o| o.entity_id == lane).cloned().collect();
                for queued_op in &remaining {
                    self.persist(queued_op);
                }
                if let Some(promoted) = promoted {
                    debug!("⏭️ [{}] 通道 {} 下一个操作: {}", self.label, lane, promoted.id);
                }

                effects.resolve(state, &op.id, Ok(server.clone()));
                effects.events.push(SyncEvent::OperationConfirmed {
                    operation_id: op.id.clone(),
                    entity_id: lane.clone(),
                    kind: op.kind,
                    timestamp: now_millis(),
                });
            } else {
                debug!("👻 [{}] 已取消操作的结果写入服务端快照: {}", self.label, op.id);
            }

            state.recompute();
            effects.changed(state);

            let next = if owns_lane {
                LaneNext::Continue(lane)
            } else {
                LaneNext::Stop
            };
            (next, queued)
        };
        self.apply(effects).await;

        if confirmed {
            if let Err(e) = self.hooks.notify_operation_confirmed(&op).await {
                warn!("⚠️ [{}] on_operation_confirmed 回调失败: {}", self.label, e);
            }
        }
        let hook_result = match (op.kind, &server) {
            (OperationKind::Create, Some(entity)) => self.hooks.notify_entity_created(entity).await,
            (OperationKind::Update, Some(entity)) => self.hooks.notify_entity_updated(entity).await,
            (OperationKind::Delete, _) => self.hooks.notify_entity_deleted(&op.entity_id).await,
            _ => Ok(()),
        };
        if let Err(e) = hook_result {
            warn!("⚠️ [{}] 实体回调失败: {}", self.label, e);
        }

        next
    }

    async fn on_failed(self: &Arc<Self>, op: PendingOperation<E>, error: RealtimeStateError, epoch: u64) -> LaneNext {
        let reason = FailureReason::from(&error);
        let mut effects = Effects::default();
        let mut failed = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.epoch != epoch {
                return LaneNext::Stop;
            }
            if state.queue.find(&op.id).is_none() {
                warn!("⚠️ [{}] 已取消的操作请求失败: {} ({})", self.label, op.id, error);
                if self.release_echo(state, &op.id) {
                    state.recompute();
                    effects.changed(state);
                }
            } else {
                let online = state.connection.is_online();
                let decision = if reason.is_retryable() && !online {
                    None
                } else {
                    Some(self.retry.handle_failure(op.attempts, &reason))
                };

                match decision {
                    None => {
                        // 离线时挂起，重连后立即重试；这次尝试不计入重试次数
                        if let Some(queued) = state.queue.find_mut(&op.id) {
                            queued.attempts = queued.attempts.saturating_sub(1);
                            queued.status = OperationStatus::Pending;
                            queued.last_error = Some(error.to_string());
                            queued.next_retry_at = None;
                            let queued = queued.clone();
                            self.persist(&queued);
                        }
                        info!("⏸️ [{}] 离线，挂起操作: {}", self.label, op.id);
                    }
                    Some(RetryDecision::RetryAfter(delay)) => {
                        let next_retry_at = now_millis() + delay.as_millis() as i64;
                        if let Some(queued) = state.queue.find_mut(&op.id) {
                            queued.status = OperationStatus::Pending;
                            queued.last_error = Some(error.to_string());
                            queued.next_retry_at = Some(next_retry_at);
                            let queued = queued.clone();
                            self.persist(&queued);
                        }
                        warn!(
                            "🔄 [{}] 操作失败，{}ms 后重试 ({}/{}): {} - {}",
                            self.label,
                            delay.as_millis(),
                            op.attempts,
                            self.retry.policy().max_attempts,
                            op.id,
                            error
                        );
                        effects.events.push(SyncEvent::OperationRetrying {
                            operation_id: op.id.clone(),
                            entity_id: op.entity_id.clone(),
                            attempt: op.attempts,
                            delay_ms: delay.as_millis() as u64,
                            error: error.to_string(),
                            timestamp: now_millis(),
                        });
                    }
                    Some(RetryDecision::GiveUp) => {
                        if let Some(mut removed) = state.queue.remove_operation(&op.id) {
                            removed.status = OperationStatus::Failed;
                            removed.last_error = Some(error.to_string());
                            self.forget(&removed.id);
                            effects.resolve(state, &removed.id, Err(error.clone()));
                            effects.events.push(SyncEvent::OperationFailed {
                                operation_id: removed.id.clone(),
                                entity_id: removed.entity_id.clone(),
                                kind: removed.kind,
                                error: error.to_string(),
                                timestamp: now_millis(),
                            });
                            failed.push(FailedOperation {
                                operation: removed,
                                error: error.clone(),
                                reason: reason.clone(),
                                failed_at: Utc::now(),
                            });
                        }

                        if state.conflicts.get(&op.entity_id).map(|c| c.operation_id == op.id).unwrap_or(false) {
                            state.conflicts.remove(&op.entity_id);
                        }

                        if op.kind == OperationKind::Create {
                            self.release_echo(state, &op.id);
                            let cascade = RealtimeStateError::Cancelled(format!("create of {} failed", op.entity_id));
                            for mut dependent in state.queue.drain_lane(&op.entity_id) {
                                dependent.status = OperationStatus::Failed;
                                dependent.last_error = Some(cascade.to_string());
                                self.forget(&dependent.id);
                                effects.resolve(state, &dependent.id, Err(cascade.clone()));
                                effects.events.push(SyncEvent::OperationFailed {
                                    operation_id: dependent.id.clone(),
                                    entity_id: dependent.entity_id.clone(),
                                    kind: dependent.kind,
                                    error: cascade.to_string(),
                                    timestamp: now_millis(),
                                });
                                failed.push(FailedOperation {
                                    operation: dependent,
                                    error: cascade.clone(),
                                    reason: FailureReason::Cancelled,
                                    failed_at: Utc::now(),
                                });
                            }
                        } else {
                            let server_version = state.store.server_entity(&op.entity_id).cloned();
                            if let Some(promoted) = state.queue.promote(&op.entity_id, server_version).cloned() {
                                self.persist(&promoted);
                            }
                        }

                        for record in &failed {
                            state.queue.record_failure(record.clone());
                        }
                        state.last_error = Some(error.to_string());
                        state.recompute();
                        effects.changed(state);
                        error!("❌ [{}] 操作最终失败，已回滚: {} - {}", self.label, op.id, error);
                    }
                }
            }
        }
        self.apply(effects).await;

        for record in &failed {
            if let Err(e) = self.hooks.notify_operation_failed(record).await {
                warn!("⚠️ [{}] on_operation_failed 回调失败: {}", self.label, e);
            }
        }

        LaneNext::Continue(op.entity_id)
    }

    /// 创建没有成功时，把为它暂扣的推送写回服务端快照，返回是否有暂扣
    fn release_echo(&self, state: &mut ManagerState<E>, operation_id: &str) -> bool {
        let Some(held) = state.held_echoes.remove(operation_id) else {
            return false;
        };
        let held_id = self.service.extract_entity_id(&held);
        self.restore_echo(state, held_id, held);
        true
    }

    fn restore_echo(&self, state: &mut ManagerState<E>, entity_id: EntityId, entity: E) {
        if state.store.server_entity(&entity_id).is_none() {
            debug!("📥 [{}] 写回暂扣的推送: {}", self.label, entity_id);
            state.store.upsert_server(entity_id, entity);
        }
    }
}
