//! 实体模型
//!
//! 同步引擎不关心具体业务字段，只要求实体能序列化为 JSON 对象，并能由
//! [`EntityService::extract_entity_id`](crate::service::EntityService::extract_entity_id)
//! 提取出稳定的 [`EntityId`]。
//!
//! 局部修改（`Partial<E>`）统一用 [`Patch`] 表示：顶层字段的集合，叠加时做浅合并。

use crate::error::{RealtimeStateError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// 顶层字段补丁
pub type Patch = serde_json::Map<String, Value>;

/// 临时 ID 前缀
pub const TEMP_ID_PREFIX: &str = "temp_";

/// 实体标识
///
/// 服务端 ID 可能是数字也可能是字符串，反序列化时两者都接受。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Num(i64),
    Str(String),
}

impl EntityId {
    /// 生成客户端临时 ID，服务端确认后会被替换
    pub fn temporary() -> Self {
        EntityId::Str(format!(
            "{}{}_{}",
            TEMP_ID_PREFIX,
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, EntityId::Str(s) if s.starts_with(TEMP_ID_PREFIX))
    }

    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Num(n) => Value::from(*n),
            EntityId::Str(s) => Value::from(s.clone()),
        }
    }

    /// 从 JSON 值中解析 ID（数字或字符串）
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(EntityId::Num),
            Value::String(s) => Some(EntityId::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Num(n) => write!(f, "{}", n),
            EntityId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Num(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Str(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::Str(value)
    }
}

/// 可被同步引擎管理的实体
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Entity for T where T: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// 实体转为字段映射
pub fn to_fields<E: Entity>(entity: &E) -> Result<Patch> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map),
        other => Err(RealtimeStateError::Serialization(format!(
            "entity must serialize to a JSON object, got {}",
            other
        ))),
    }
}

pub fn from_fields<E: Entity>(fields: Patch) -> Result<E> {
    Ok(serde_json::from_value(Value::Object(fields))?)
}

/// 浅合并：`{...entity, ...patch}`
pub fn apply_patch<E: Entity>(entity: &E, patch: &Patch) -> Result<E> {
    let mut fields = to_fields(entity)?;
    for (key, value) in patch {
        fields.insert(key.clone(), value.clone());
    }
    from_fields(fields)
}

/// 由创建载荷合成乐观实体（载荷 + ID 字段）
pub fn synthesize<E: Entity>(id_field: &str, id: &EntityId, payload: &Patch) -> Result<E> {
    let mut fields = payload.clone();
    fields.insert(id_field.to_string(), id.to_value());
    from_fields(fields)
}

/// 两个版本之间取值不同的字段（忽略 `ignore` 中的字段），按字段名排序
pub fn diff_fields<E: Entity>(a: &E, b: &E, ignore: &[String]) -> Result<Vec<String>> {
    let left = to_fields(a)?;
    let right = to_fields(b)?;
    let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();

    Ok(keys
        .into_iter()
        .filter(|key| !ignore.iter().any(|i| i == *key))
        .filter(|key| left.get(*key) != right.get(*key))
        .cloned()
        .collect())
}

/// 忽略 `ignore` 字段后是否结构相等
pub fn same_content<E: Entity>(a: &E, b: &E, ignore: &[String]) -> Result<bool> {
    Ok(diff_fields(a, b, ignore)?.is_empty())
}

/// 实体是否包含载荷中的全部字段且取值相同（ID 字段除外）
pub fn matches_payload<E: Entity>(entity: &E, payload: &Patch, id_field: &str) -> Result<bool> {
    let fields = to_fields(entity)?;
    Ok(payload
        .iter()
        .filter(|(key, _)| key.as_str() != id_field)
        .all(|(key, value)| fields.get(key) == Some(value)))
}

/// 计算 `to` 相对于 `from` 的变更字段，作为补丁
pub fn patch_between<E: Entity>(from: &E, to: &E, ignore: &[String]) -> Result<Patch> {
    let target = to_fields(to)?;
    let changed = diff_fields(from, to, ignore)?;
    Ok(changed
        .into_iter()
        .map(|key| {
            let value = target.get(&key).cloned().unwrap_or(Value::Null);
            (key, value)
        })
        .collect())
}
