//! 待同步操作队列
//!
//! 每个实体一条 FIFO 通道（lane），通道头部是唯一的活跃操作，后续操作排在其后，
//! 不会与之并发发出。不同实体的通道彼此独立。

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::entity::EntityId;

pub mod pending_operation;
pub mod retry_policy;

pub use pending_operation::{FailedOperation, OperationKind, OperationStatus, PendingOperation};
pub use retry_policy::{FailureReason, RetryDecision, RetryManager, RetryPolicy};

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    /// 有待同步操作的实体数
    pub active_lanes: usize,
    pub total_operations: usize,
    pub pending_operations: usize,
    pub in_flight_operations: usize,
    pub failed_log_size: usize,
    pub operations_by_kind: HashMap<OperationKind, usize>,
}

#[derive(Debug, Clone)]
pub struct PendingQueue<E> {
    lanes: HashMap<EntityId, VecDeque<PendingOperation<E>>>,
    next_seq: u64,
    failed: VecDeque<FailedOperation<E>>,
    failed_capacity: usize,
}

impl<E: Clone> PendingQueue<E> {
    pub fn new(failed_capacity: usize) -> Self {
        Self {
            lanes: HashMap::new(),
            next_seq: 1,
            failed: VecDeque::new(),
            failed_capacity,
        }
    }

    /// 入队，返回该操作是否成为通道头部（活跃操作）
    pub fn enqueue(&mut self, mut op: PendingOperation<E>) -> bool {
        op.seq = self.next_seq;
        self.next_seq += 1;
        self.push_lane(op)
    }

    /// 恢复持久化的操作，保留原有序号
    pub fn restore(&mut self, mut ops: Vec<PendingOperation<E>>) {
        ops.sort_by_key(|op| op.seq);
        for mut op in ops {
            self.next_seq = self.next_seq.max(op.seq + 1);
            op.status = OperationStatus::Pending;
            op.next_retry_at = None;
            self.push_lane(op);
        }
    }

    fn push_lane(&mut self, op: PendingOperation<E>) -> bool {
        debug!("📥 入队操作: {} {} {}", op.id, op.kind, op.entity_id);
        let lane = self.lanes.entry(op.entity_id.clone()).or_default();
        lane.push_back(op);
        lane.len() == 1
    }

    pub fn head(&self, entity_id: &EntityId) -> Option<&PendingOperation<E>> {
        self.lanes.get(entity_id).and_then(|lane| lane.front())
    }

    pub fn head_mut(&mut self, entity_id: &EntityId) -> Option<&mut PendingOperation<E>> {
        self.lanes.get_mut(entity_id).and_then(|lane| lane.front_mut())
    }

    pub fn lane_len(&self, entity_id: &EntityId) -> usize {
        self.lanes.get(entity_id).map(|lane| lane.len()).unwrap_or(0)
    }

    pub fn has_pending(&self, entity_id: &EntityId) -> bool {
        self.lane_len(entity_id) > 0
    }

    pub fn find(&self, operation_id: &str) -> Option<&PendingOperation<E>> {
        self.lanes.values().flat_map(|lane| lane.iter()).find(|op| op.id == operation_id)
    }

    pub fn find_mut(&mut self, operation_id: &str) -> Option<&mut PendingOperation<E>> {
        self.lanes
            .values_mut()
            .flat_map(|lane| lane.iter_mut())
            .find(|op| op.id == operation_id)
    }

    /// 操作是否是其通道的头部
    pub fn is_head(&self, operation_id: &str) -> bool {
        self.lanes
            .values()
            .any(|lane| lane.front().map(|op| op.id == operation_id).unwrap_or(false))
    }

    /// 移除通道头部（确认或永久失败后调用）
    pub fn dequeue(&mut self, entity_id: &EntityId) -> Option<PendingOperation<E>> {
        let lane = self.lanes.get_mut(entity_id)?;
        let op = lane.pop_front();
        if lane.is_empty() {
            self.lanes.remove(entity_id);
        }
        op
    }

    /// 将新的通道头部变基到当前服务端版本；在途的头部保持不变
    pub fn promote(&mut self, entity_id: &EntityId, server_version: Option<E>) -> Option<&PendingOperation<E>> {
        let head = self.head_mut(entity_id)?;
        if head.is_in_flight() {
            return Some(&*head);
        }
        if head.kind != OperationKind::Create {
            head.base = server_version;
        }
        head.status = OperationStatus::Pending;
        Some(&*head)
    }

    /// 按操作 ID 移除（任意位置）
    pub fn remove_operation(&mut self, operation_id: &str) -> Option<PendingOperation<E>> {
        let entity_id = self.find(operation_id)?.entity_id.clone();
        let lane = self.lanes.get_mut(&entity_id)?;
        let index = lane.iter().position(|op| op.id == operation_id)?;
        let op = lane.remove(index);
        if lane.is_empty() {
            self.lanes.remove(&entity_id);
        }
        op
    }

    /// 移除整个通道
    pub fn drain_lane(&mut self, entity_id: &EntityId) -> Vec<PendingOperation<E>> {
        self.lanes.remove(entity_id).map(Vec::from).unwrap_or_default()
    }

    /// 创建确认后，把临时 ID 的通道迁移到服务端 ID
    ///
    /// 服务端 ID 已有通道时两者按入队序号合并。
    pub fn rekey(&mut self, from: &EntityId, to: &EntityId) {
        let Some(mut lane) = self.lanes.remove(from) else {
            return;
        };
        for op in lane.iter_mut() {
            op.entity_id = to.clone();
        }
        debug!("🔁 通道迁移: {} -> {} ({} 个操作)", from, to, lane.len());
        let target = self.lanes.entry(to.clone()).or_default();
        target.extend(lane);
        target.make_contiguous().sort_by_key(|op| op.seq);
    }

    /// 所有操作，按入队顺序
    pub fn ordered(&self) -> Vec<&PendingOperation<E>> {
        let mut ops: Vec<&PendingOperation<E>> = self.lanes.values().flat_map(|lane| lane.iter()).collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    pub fn operations(&self) -> Vec<PendingOperation<E>> {
        self.ordered().into_iter().cloned().collect()
    }

    /// 所有通道头部（活跃操作）
    pub fn heads(&self) -> Vec<&PendingOperation<E>> {
        let mut heads: Vec<&PendingOperation<E>> = self.lanes.values().filter_map(|lane| lane.front()).collect();
        heads.sort_by_key(|op| op.seq);
        heads
    }

    pub fn len(&self) -> usize {
        self.lanes.values().map(|lane| lane.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// 清空所有通道，返回被移除的操作
    pub fn clear(&mut self) -> Vec<PendingOperation<E>> {
        let mut ops: Vec<PendingOperation<E>> = self.lanes.drain().flat_map(|(_, lane)| lane).collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    /// 记录失败操作，超出容量时丢弃最旧的
    pub fn record_failure(&mut self, failed: FailedOperation<E>) {
        if self.failed_capacity == 0 {
            return;
        }
        while self.failed.len() >= self.failed_capacity {
            self.failed.pop_front();
        }
        self.failed.push_back(failed);
    }

    pub fn failed(&self) -> Vec<FailedOperation<E>> {
        self.failed.iter().cloned().collect()
    }

    pub fn failed_len(&self) -> usize {
        self.failed.len()
    }

    pub fn clear_failed(&mut self) {
        self.failed.clear();
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            active_lanes: self.lanes.len(),
            failed_log_size: self.failed.len(),
            ..QueueStats::default()
        };
        for op in self.lanes.values().flat_map(|lane| lane.iter()) {
            stats.total_operations += 1;
            match op.status {
                OperationStatus::InFlight => stats.in_flight_operations += 1,
                _ => stats.pending_operations += 1,
            }
            *stats.operations_by_kind.entry(op.kind).or_insert(0) += 1;
        }
        stats
    }
}
