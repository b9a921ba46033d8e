//! 实时通道连接状态
//!
//! 记录推送通道的连接状态、重连次数以及收到的事件统计，用于日志和诊断。

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 已连接
    Connected,
    /// 断线后重新连接中（第一次连接之后的断开）
    Reconnecting,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Reconnecting => write!(f, "重连中"),
        }
    }
}

/// 实时事件统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStats {
    /// 收到的实时事件数
    pub events_received: u64,
    /// 改变了本地状态的事件数
    pub events_applied: u64,
    /// 幂等忽略的事件数（内容未变化）
    pub events_ignored: u64,
    /// 按 event_id 去重丢弃的事件数
    pub duplicate_events: u64,
    /// 最后事件时间（UTC毫秒时间戳）
    pub last_event_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// 连接建立时间（UTC毫秒时间戳）
    pub connected_at: Option<i64>,
    pub disconnected_at: Option<i64>,
    /// 成功连接的次数（首次连接不计入重连）
    pub reconnect_count: u32,
    pub stats: EventStats,
    /// 所属 feature，如 `budgets/budget`
    pub feature: String,
    pub version: String,
    /// 尚未收到任何连接事件时是否允许派发远端请求
    pub assume_online: bool,
}

impl ConnectionState {
    pub fn new(feature: impl Into<String>, assume_online: bool) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connected_at: None,
            disconnected_at: None,
            reconnect_count: 0,
            stats: EventStats::default(),
            feature: feature.into(),
            version: crate::VERSION.to_string(),
            assume_online,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// 是否可以派发远端请求：已连接，或从未断开且假定在线
    pub fn is_online(&self) -> bool {
        match self.status {
            ConnectionStatus::Connected => true,
            ConnectionStatus::Disconnected => self.assume_online && self.disconnected_at.is_none(),
            ConnectionStatus::Reconnecting => false,
        }
    }

    /// 标记连接成功，返回是否是一次重连
    pub fn mark_connected(&mut self) -> bool {
        let reconnect = self.disconnected_at.is_some();
        if reconnect {
            self.reconnect_count += 1;
        }
        self.status = ConnectionStatus::Connected;
        self.connected_at = Some(Utc::now().timestamp_millis());
        reconnect
    }

    pub fn mark_disconnected(&mut self) {
        self.status = if self.connected_at.is_some() {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Disconnected
        };
        self.connected_at = None;
        self.disconnected_at = Some(Utc::now().timestamp_millis());
    }

    pub fn record_event(&mut self, applied: bool) {
        self.stats.events_received += 1;
        if applied {
            self.stats.events_applied += 1;
        } else {
            self.stats.events_ignored += 1;
        }
        self.stats.last_event_time = Some(Utc::now().timestamp_millis());
    }

    pub fn record_duplicate(&mut self) {
        self.stats.events_received += 1;
        self.stats.duplicate_events += 1;
        self.stats.last_event_time = Some(Utc::now().timestamp_millis());
    }

    /// 获取连接持续时间（秒）
    pub fn connection_duration_secs(&self) -> Option<i64> {
        self.connected_at
            .map(|connected_at| (Utc::now().timestamp_millis() - connected_at) / 1000)
    }

    fn format_connection_duration(&self) -> String {
        match self.connection_duration_secs() {
            Some(secs) => {
                let hours = secs / 3600;
                let minutes = (secs % 3600) / 60;
                let seconds = secs % 60;
                if hours > 0 {
                    format!("{}小时{}分{}秒", hours, minutes, seconds)
                } else if minutes > 0 {
                    format!("{}分{}秒", minutes, seconds)
                } else {
                    format!("{}秒", seconds)
                }
            }
            None => "未连接".to_string(),
        }
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        format!(
            "【实时通道】\n\
             模块: {}\n\
             状态: {}\n\
             已连接: {}\n\
             重连次数: {}\n\
             事件: 接收{}条/应用{}条/忽略{}条/重复{}条\n\
             版本: {}",
            self.feature,
            self.status,
            self.format_connection_duration(),
            self.reconnect_count,
            self.stats.events_received,
            self.stats.events_applied,
            self.stats.events_ignored,
            self.stats.duplicate_events,
            self.version
        )
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
