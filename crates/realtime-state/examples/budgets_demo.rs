//! 预算模块同步演示
//!
//! 使用内存版预算服务展示乐观创建、更新、实时事件、冲突和重连补推。

use async_trait::async_trait;
use parking_lot::Mutex;
use realtime_state::{
    EntityId, EntityService, Patch, RealtimeEnvelope, RealtimeStateError, RealtimeStateManager, Result,
    StateManagerConfig, SyncEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Budget {
    id: EntityId,
    name: String,
    amount: f64,
    #[serde(rename = "updatedAt", default)]
    updated_at: Option<String>,
}

/// 内存版预算服务，模拟 REST 接口
struct BudgetService {
    budgets: Mutex<Vec<Budget>>,
    next_id: AtomicI64,
}

impl BudgetService {
    fn new() -> Self {
        Self {
            budgets: Mutex::new(vec![Budget {
                id: EntityId::Num(1),
                name: "房租".to_string(),
                amount: 3000.0,
                updated_at: Some(chrono::Utc::now().to_rfc3339()),
            }]),
            next_id: AtomicI64::new(2),
        }
    }

    fn touch(fields: &mut Patch) {
        fields.insert("updatedAt".to_string(), Value::from(chrono::Utc::now().to_rfc3339()));
    }
}

#[async_trait]
impl EntityService<Budget> for BudgetService {
    async fn fetch_all(&self) -> Result<Vec<Budget>> {
        sleep(Duration::from_millis(50)).await;
        Ok(self.budgets.lock().clone())
    }

    async fn create(&self, data: &Patch) -> Result<Budget> {
        sleep(Duration::from_millis(100)).await;
        let mut fields = data.clone();
        fields.insert("id".to_string(), Value::from(self.next_id.fetch_add(1, Ordering::SeqCst)));
        Self::touch(&mut fields);
        let budget: Budget = serde_json::from_value(Value::Object(fields))?;
        self.budgets.lock().push(budget.clone());
        Ok(budget)
    }

    async fn update(&self, id: &EntityId, changes: &Patch) -> Result<Budget> {
        sleep(Duration::from_millis(100)).await;
        let mut budgets = self.budgets.lock();
        let existing = budgets
            .iter_mut()
            .find(|b| &b.id == id)
            .ok_or_else(|| RealtimeStateError::NotFound(format!("budget {}", id)))?;
        let mut fields = realtime_state::entity::to_fields(existing)?;
        fields.extend(changes.clone());
        Self::touch(&mut fields);
        *existing = serde_json::from_value(Value::Object(fields))?;
        Ok(existing.clone())
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        sleep(Duration::from_millis(100)).await;
        self.budgets.lock().retain(|b| &b.id != id);
        Ok(())
    }

    fn extract_entity_id(&self, entity: &Budget) -> EntityId {
        entity.id.clone()
    }
}

fn fields(value: Value) -> Patch {
    match value {
        Value::Object(map) => map,
        _ => Patch::new(),
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    println!("\n🚀 预算实时同步演示\n");
    println!("====================================\n");

    let config = StateManagerConfig::builder("budgets", "budget")
        .debounce_ms(100)
        .retry_attempts(3)
        .build()?;
    let manager = RealtimeStateManager::new(config, Arc::new(BudgetService::new()))?;

    manager
        .add_listener("*", |event: &SyncEvent| {
            println!("   📣 事件: {}", event.event_type());
        })
        .await;

    println!("📦 正在初始化...");
    manager.initialize().await?;
    println!("✅ 初始化完成，共 {} 个预算\n", manager.local_state().len());

    // 乐观创建
    println!("【乐观创建】");
    let created = manager
        .optimistic_create(fields(json!({"name": "餐饮", "amount": 1500.0})))
        .await?;
    println!("   本地立即可见: {} (临时 ID: {})", created.entity.name, created.entity.id);
    let confirmed = created.confirmation.confirmed().await?;
    if let Some(budget) = confirmed {
        println!("   ✅ 服务端确认: ID {}\n", budget.id);
    }

    // 乐观更新
    println!("【乐观更新】");
    let updated = manager
        .optimistic_update(&EntityId::Num(1), fields(json!({"amount": 3200.0})))
        .await?;
    println!("   本地金额: {}", updated.entity.amount);
    updated.confirmation.confirmed().await?;
    println!("   ✅ 更新已确认\n");

    // 其他客户端的修改
    println!("【实时事件】");
    manager
        .handle_realtime_message(
            RealtimeEnvelope::new(
                "entity.updated",
                json!({"id": 1, "name": "房租（含物业）", "amount": 3400.0}),
            )
            .with_event_id("evt-1001"),
        )
        .await?;
    println!("   当前名称: {:?}\n", manager.get_entity(&EntityId::Num(1)).map(|b| b.name));

    // 断线期间的修改在重连后补推
    println!("【断线重连】");
    manager.on_realtime_disconnected().await;
    let offline = manager
        .optimistic_create(fields(json!({"name": "交通", "amount": 400.0})))
        .await?;
    sleep(Duration::from_millis(300)).await;
    println!("   离线排队中: {} 个操作", manager.pending_operations().len());
    manager.on_realtime_connected().await?;
    offline.confirmation.confirmed().await?;
    println!("   ✅ 重连后已推送\n");

    let stats = manager.get_sync_stats();
    println!("【同步统计】");
    println!("   本地: {} / 服务端: {}", stats.local_count, stats.server_count);
    println!("   待同步: {} / 冲突: {} / 失败: {}", stats.pending_count, stats.conflict_count, stats.failed_count);
    println!("\n{}", manager.connection_state().summary());

    println!("\n🎉 演示结束");
    Ok(())
}
