use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 实时事件去重
///
/// 推送通道在重连后可能重放事件，带 `event_id` 的事件只处理一次。
pub struct EventDeduplicator {
    /// 已处理的事件 (event_id -> 处理时间)
    processed: Mutex<HashMap<String, Instant>>,
    retention: Duration,
    max_cache_size: usize,
    /// 超过此数量时触发清理
    cleanup_threshold: usize,
}

impl EventDeduplicator {
    pub fn new(retention: Duration, max_cache_size: usize) -> Self {
        Self {
            processed: Mutex::new(HashMap::new()),
            retention,
            max_cache_size: max_cache_size.max(1),
            cleanup_threshold: (max_cache_size * 4 / 5).max(1),
        }
    }

    pub fn is_duplicate(&self, event_id: &str) -> bool {
        self.processed.lock().contains_key(event_id)
    }

    pub fn mark_as_processed(&self, event_id: &str) {
        let mut processed = self.processed.lock();
        processed.insert(event_id.to_string(), Instant::now());
        if processed.len() > self.cleanup_threshold {
            self.cleanup_internal(&mut processed);
        }
    }

    /// 检查并标记；返回 true 表示重复事件
    pub fn check_and_mark(&self, event_id: &str) -> bool {
        let mut processed = self.processed.lock();
        if processed.contains_key(event_id) {
            debug!("🔄 检测到重复事件: event_id={}", event_id);
            return true;
        }
        processed.insert(event_id.to_string(), Instant::now());
        if processed.len() > self.cleanup_threshold {
            self.cleanup_internal(&mut processed);
        }
        false
    }

    fn cleanup_internal(&self, processed: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        let initial_count = processed.len();
        processed.retain(|_, seen| now.duration_since(*seen) <= self.retention);

        // 仍然超出容量时淘汰最旧的记录
        if processed.len() > self.max_cache_size {
            let mut entries: Vec<(String, Instant)> = processed.drain().collect();
            entries.sort_by_key(|(_, seen)| std::cmp::Reverse(*seen));
            entries.truncate(self.max_cache_size);
            processed.extend(entries);
        }

        let removed = initial_count - processed.len();
        if removed > 0 {
            info!("🧹 清理事件去重记录: 移除了 {} 条，剩余 {} 条", removed, processed.len());
        }
    }

    pub fn cleanup_expired(&self) {
        let mut processed = self.processed.lock();
        self.cleanup_internal(&mut processed);
    }

    /// (当前记录数, 最大容量)
    pub fn stats(&self) -> (usize, usize) {
        (self.processed.lock().len(), self.max_cache_size)
    }

    pub fn clear(&self) {
        self.processed.lock().clear();
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 10_000)
    }
}
