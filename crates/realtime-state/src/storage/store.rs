//! 本地存储
//!
//! 保存最近一次服务端确认的快照，以及叠加了待同步操作之后的本地视图。
//! 本地视图只由 [`LocalStore::recompute`] 写入：它总是等于
//! “服务端快照 + 按入队顺序叠加全部待同步操作”，因此回滚只需移除操作后重算。

use crate::entity::{self, Entity, EntityId};
use crate::storage::queue::{OperationKind, PendingOperation, PendingQueue};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct LocalStore<E> {
    server: Vec<(EntityId, E)>,
    local: Vec<(EntityId, E)>,
    id_field: String,
}

impl<E: Entity> LocalStore<E> {
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            server: Vec::new(),
            local: Vec::new(),
            id_field: id_field.into(),
        }
    }

    pub fn local_state(&self) -> Vec<E> {
        self.local.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn server_state(&self) -> Vec<E> {
        self.server.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn server_len(&self) -> usize {
        self.server.len()
    }

    pub fn local_entity(&self, id: &EntityId) -> Option<&E> {
        self.local.iter().find(|(eid, _)| eid == id).map(|(_, e)| e)
    }

    pub fn server_entity(&self, id: &EntityId) -> Option<&E> {
        self.server.iter().find(|(eid, _)| eid == id).map(|(_, e)| e)
    }

    /// 用完整快照替换服务端状态
    pub fn apply_server_snapshot(&mut self, entities: Vec<(EntityId, E)>, queue: &PendingQueue<E>) {
        self.server = entities;
        self.recompute(queue);
    }

    /// 插入或替换单个服务端实体（保持原位置）
    pub fn upsert_server(&mut self, id: EntityId, entity: E) {
        match self.server.iter_mut().find(|(eid, _)| *eid == id) {
            Some(slot) => slot.1 = entity,
            None => self.server.push((id, entity)),
        }
    }

    pub fn remove_server(&mut self, id: &EntityId) -> Option<E> {
        let index = self.server.iter().position(|(eid, _)| eid == id)?;
        Some(self.server.remove(index).1)
    }

    pub fn clear(&mut self) {
        self.server.clear();
        self.local.clear();
    }

    /// 重新计算本地视图
    pub fn recompute(&mut self, queue: &PendingQueue<E>) {
        let mut view = self.server.clone();
        for op in queue.ordered() {
            apply_pending_overlay(&mut view, op, &self.id_field);
        }
        self.local = view;
    }
}

/// 把单个待同步操作叠加到视图上
///
/// - create：追加由载荷合成的实体
/// - update：浅合并载荷
/// - delete：从视图移除
pub fn apply_pending_overlay<E: Entity>(view: &mut Vec<(EntityId, E)>, op: &PendingOperation<E>, id_field: &str) {
    match op.kind {
        OperationKind::Create => {
            if view.iter().any(|(id, _)| *id == op.entity_id) {
                return;
            }
            match entity::synthesize::<E>(id_field, &op.entity_id, &op.payload) {
                Ok(e) => view.push((op.entity_id.clone(), e)),
                Err(e) => warn!("⚠️ 无法合成乐观实体 {}: {}", op.entity_id, e),
            }
        }
        OperationKind::Update => {
            if let Some(slot) = view.iter_mut().find(|(id, _)| *id == op.entity_id) {
                match entity::apply_patch(&slot.1, &op.payload) {
                    Ok(merged) => slot.1 = merged,
                    Err(e) => warn!("⚠️ 无法叠加更新 {}: {}", op.entity_id, e),
                }
            }
        }
        OperationKind::Delete => view.retain(|(id, _)| *id != op.entity_id),
    }
}
