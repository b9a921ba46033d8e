//! 待同步操作日志 - 基于 sled
//!
//! 启用后，每个入队的操作都会写入一个 sled Tree，完成、失败或取消时删除。
//! 进程重启后由 `initialize()` 读回并重新入队，离线期间的修改不会丢失。

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use tracing::{debug, info, warn};

use crate::error::{RealtimeStateError, Result};
use crate::storage::queue::PendingOperation;

#[derive(Debug, Clone)]
pub struct OperationJournal {
    path: PathBuf,
    #[allow(dead_code)]
    db: Db,
    tree: Tree,
}

impl OperationJournal {
    /// 打开（或创建）某个 feature 的操作日志
    pub fn open(path: &Path, namespace: &str) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| RealtimeStateError::Storage(format!("创建操作日志目录失败: {}", e)))?;

        // 旧实例刚释放文件锁时可能短暂打不开，带退避重试
        const MAX_OPEN_RETRIES: u32 = 6;
        const RETRY_DELAY_MS: u64 = 50;
        let mut attempt = 0;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(RealtimeStateError::Storage(format!("打开 sled 数据库失败: {}", e)));
                    }
                    std::thread::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS << attempt));
                }
            }
        };
        let tree_name = format!("pending_{}", namespace.replace('/', "_"));
        let tree = db
            .open_tree(&tree_name)
            .map_err(|e| RealtimeStateError::Storage(format!("打开操作日志 Tree 失败: {}", e)))?;

        info!("📒 操作日志已打开: {} ({})", path.display(), tree_name);
        Ok(Self {
            path: path.to_path_buf(),
            db,
            tree,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 写入或覆盖一个操作
    pub fn persist<E: Serialize>(&self, op: &PendingOperation<E>) -> Result<()> {
        let bytes = serde_json::to_vec(op)?;
        self.tree.insert(op.id.as_bytes(), bytes)?;
        self.tree.flush()?;
        debug!("📝 持久化操作: {}", op.id);
        Ok(())
    }

    pub fn remove(&self, operation_id: &str) -> Result<()> {
        self.tree.remove(operation_id.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    /// 读取全部操作，按入队序号排序；无法解析的条目会被丢弃
    pub fn load_all<E: DeserializeOwned>(&self) -> Result<Vec<PendingOperation<E>>> {
        let mut ops = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<PendingOperation<E>>(&value) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    warn!("⚠️ 丢弃无法解析的操作日志条目 {}: {}", String::from_utf8_lossy(&key), e);
                    self.tree.remove(key)?;
                }
            }
        }
        ops.sort_by_key(|op| op.seq);
        Ok(ops)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }
}
