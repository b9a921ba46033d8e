//! 测试辅助：内存版实体服务
//!
//! `MockService` 模拟远端 CRUD 服务，支持脚本化失败、暂停在途请求和调用记录。

use crate::config::StateManagerConfig;
use crate::entity::{EntityId, Patch};
use crate::error::{RealtimeStateError, Result};
use crate::service::EntityService;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestItem {
    pub id: EntityId,
    pub name: String,
    pub qty: i64,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TestItem {
    pub fn new(id: i64, name: &str, qty: i64) -> Self {
        Self {
            id: EntityId::Num(id),
            name: name.to_string(),
            qty,
            updated_at: None,
        }
    }
}

pub fn patch(fields: &[(&str, Value)]) -> Patch {
    fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// 测试用配置：无防抖、快速退避、无抖动
pub fn test_config() -> StateManagerConfig {
    StateManagerConfig::builder("tests", "item")
        .debounce_ms(0)
        .retry_backoff(10, 40, 2.0)
        .retry_jitter(0.0)
        .request_timeout_ms(Some(2_000))
        .build()
        .unwrap()
}

/// 轮询等待条件成立（最多约 2 秒）
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Default)]
pub struct MockService {
    items: Mutex<Vec<TestItem>>,
    next_id: AtomicI64,
    failures: Mutex<HashMap<&'static str, VecDeque<RealtimeStateError>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(100),
            ..Default::default()
        })
    }

    pub fn with_items(items: Vec<TestItem>) -> Arc<Self> {
        let service = Self::new();
        *service.items.lock() = items;
        service
    }

    /// 直接修改服务端数据（模拟其他客户端）
    pub fn set_server_item(&self, item: TestItem) {
        let mut items = self.items.lock();
        match items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
    }

    pub fn server_items(&self) -> Vec<TestItem> {
        self.items.lock().clone()
    }

    /// 下一次 `op` 调用返回指定错误（可多次调用排队）
    pub fn fail_next(&self, op: &'static str, error: RealtimeStateError) {
        self.failures.lock().entry(op).or_default().push_back(error);
    }

    /// 暂停所有后续调用，直到 `release`/`resume`
    pub fn pause(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(permits);
        }
    }

    pub fn resume(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: String, op: &'static str) -> Result<()> {
        self.calls.lock().push(call);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        // 让出一次，给并发请求交错的机会
        tokio::task::yield_now().await;

        let failure = self.failures.lock().get_mut(op).and_then(|q| q.pop_front());
        match failure {
            Some(error) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntityService<TestItem> for MockService {
    async fn fetch_all(&self) -> Result<Vec<TestItem>> {
        self.enter("fetch_all".to_string(), "fetch_all").await?;
        self.leave();
        Ok(self.server_items())
    }

    async fn create(&self, data: &Patch) -> Result<TestItem> {
        self.enter("create".to_string(), "create").await?;
        self.leave();
        let mut fields = data.clone();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        fields.insert("id".to_string(), Value::from(id));
        let item: TestItem = serde_json::from_value(Value::Object(fields))?;
        self.items.lock().push(item.clone());
        Ok(item)
    }

    async fn update(&self, id: &EntityId, changes: &Patch) -> Result<TestItem> {
        self.enter(format!("update:{}", id), "update").await?;
        self.leave();
        let mut items = self.items.lock();
        let existing = items
            .iter_mut()
            .find(|i| &i.id == id)
            .ok_or_else(|| RealtimeStateError::NotFound(id.to_string()))?;
        let updated: TestItem = crate::entity::apply_patch(existing, changes)?;
        *existing = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        self.enter(format!("delete:{}", id), "delete").await?;
        self.leave();
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|i| &i.id != id);
        if items.len() == before {
            return Err(RealtimeStateError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn extract_entity_id(&self, entity: &TestItem) -> EntityId {
        entity.id.clone()
    }
}
