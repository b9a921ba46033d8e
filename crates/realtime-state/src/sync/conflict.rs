//! 冲突检测
//!
//! 当实体存在活跃的待同步操作时，收到的服务端版本要和操作记录的 `base`
//! （变更发生时的服务端版本）比较：
//!
//! - 与 base 相同：服务端没有变化
//! - 与 base ⊕ 本地修改相同：这是我们自己写入的回声
//! - 其他情况：并发修改，记录冲突
//!
//! 比较时忽略服务端维护的字段（如 `updatedAt`）。

use crate::entity::{self, Entity, EntityId, Patch};
use crate::error::Result;
use crate::storage::queue::{OperationKind, PendingOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 冲突信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo<E> {
    pub entity_id: EntityId,
    /// 引发冲突的本地操作
    pub operation_id: String,
    /// 本地视图中的版本（含未确认修改）
    pub local_version: E,
    pub server_version: E,
    /// 本地修改发生时的服务端版本
    pub base_version: Option<E>,
    pub local_changes: Patch,
    /// 服务端相对 base 改动过的字段
    pub conflicted_fields: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// 检测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// 无需检测（没有 base、创建操作或检测被关闭）
    NotApplicable,
    Unchanged,
    /// 服务端版本正是本地修改的结果
    Echo,
    Conflict(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    enabled: bool,
    ignored_fields: Vec<String>,
}

impl ConflictDetector {
    pub fn new(enabled: bool, ignored_fields: Vec<String>) -> Self {
        Self { enabled, ignored_fields }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ignored_fields(&self) -> &[String] {
        &self.ignored_fields
    }

    pub fn evaluate<E: Entity>(&self, op: &PendingOperation<E>, server: &E) -> Result<Detection> {
        if !self.enabled || op.kind == OperationKind::Create {
            return Ok(Detection::NotApplicable);
        }
        let Some(base) = op.base.as_ref() else {
            return Ok(Detection::NotApplicable);
        };

        let changed = entity::diff_fields(base, server, &self.ignored_fields)?;
        if changed.is_empty() {
            return Ok(Detection::Unchanged);
        }

        if op.kind == OperationKind::Update {
            let expected = entity::apply_patch(base, &op.payload)?;
            if entity::same_content(&expected, server, &self.ignored_fields)? {
                return Ok(Detection::Echo);
            }
        }

        Ok(Detection::Conflict(changed))
    }

    /// 构造冲突记录
    pub fn build_conflict<E: Entity>(
        &self,
        op: &PendingOperation<E>,
        local_version: E,
        server_version: E,
        conflicted_fields: Vec<String>,
    ) -> ConflictInfo<E> {
        ConflictInfo {
            entity_id: op.entity_id.clone(),
            operation_id: op.id.clone(),
            local_version,
            server_version,
            base_version: op.base.clone(),
            local_changes: op.payload.clone(),
            conflicted_fields,
            detected_at: Utc::now(),
        }
    }
}

/// 合并函数：根据冲突信息计算要提交的补丁（在服务端版本之上）
pub type MergeFn<E> = Box<dyn FnOnce(&ConflictInfo<E>) -> Patch + Send>;

/// 冲突解决方式
pub enum ConflictResolution<E> {
    /// 放弃本地修改，采用服务端版本
    AcceptServer,
    /// 以服务端版本为基础重新提交本地修改
    AcceptLocal,
    Merge(MergeFn<E>),
}

impl<E: 'static> ConflictResolution<E> {
    /// `{...server, ...localChanges}`
    pub fn merge_prefer_local() -> Self {
        ConflictResolution::Merge(Box::new(|info: &ConflictInfo<E>| info.local_changes.clone()))
    }

    pub fn merge_with<F>(merge: F) -> Self
    where
        F: FnOnce(&ConflictInfo<E>) -> Patch + Send + 'static,
    {
        ConflictResolution::Merge(Box::new(merge))
    }
}

impl<E> ConflictResolution<E> {
    pub fn name(&self) -> &'static str {
        match self {
            ConflictResolution::AcceptServer => "accept_server",
            ConflictResolution::AcceptLocal => "accept_local",
            ConflictResolution::Merge(_) => "merge",
        }
    }
}

impl<E> fmt::Debug for ConflictResolution<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConflictResolution::{}", self.name())
    }
}

/// 观察者对冲突给出的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictDecision {
    AcceptServer,
    AcceptLocal,
    MergePreferLocal,
    /// 保留冲突，等待调用方显式 `resolve_conflict`
    Defer,
}

impl ConflictDecision {
    pub fn into_resolution<E: 'static>(self) -> Option<ConflictResolution<E>> {
        match self {
            ConflictDecision::AcceptServer => Some(ConflictResolution::AcceptServer),
            ConflictDecision::AcceptLocal => Some(ConflictResolution::AcceptLocal),
            ConflictDecision::MergePreferLocal => Some(ConflictResolution::merge_prefer_local()),
            ConflictDecision::Defer => None,
        }
    }
}
