//! 远端实体服务接口
//!
//! 同步引擎只依赖这四个 CRUD 操作，HTTP 客户端、鉴权等由调用方实现。

use crate::entity::{EntityId, Patch};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait EntityService<E>: Send + Sync {
    /// 拉取完整集合（作为权威快照）
    async fn fetch_all(&self) -> Result<Vec<E>>;

    /// 创建实体，返回服务端分配 ID 后的实体
    async fn create(&self, data: &Patch) -> Result<E>;

    async fn update(&self, id: &EntityId, changes: &Patch) -> Result<E>;

    async fn delete(&self, id: &EntityId) -> Result<()>;

    /// 提取实体 ID
    fn extract_entity_id(&self, entity: &E) -> EntityId;

    /// 生成临时 ID，默认 `temp_<毫秒>_<uuid>`
    fn temporary_id(&self) -> EntityId {
        EntityId::temporary()
    }
}
