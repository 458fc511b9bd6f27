use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityEventKind {
    Connected,
    Disconnected,
    Reconnected,
    HeartbeatMissed,
}

impl ConnectivityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityEventKind::Connected => "connected",
            ConnectivityEventKind::Disconnected => "disconnected",
            ConnectivityEventKind::Reconnected => "reconnected",
            ConnectivityEventKind::HeartbeatMissed => "heartbeat_missed",
        }
    }
}

impl fmt::Display for ConnectivityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectivityEventKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(ConnectivityEventKind::Connected),
            "disconnected" => Ok(ConnectivityEventKind::Disconnected),
            "reconnected" => Ok(ConnectivityEventKind::Reconnected),
            "heartbeat_missed" => Ok(ConnectivityEventKind::HeartbeatMissed),
            _ => Err(SchedulerError::Serialization(format!(
                "无效的连接事件类型: {s}"
            ))),
        }
    }
}

/// Worker连接事件审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub kind: ConnectivityEventKind,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ConnectivityEvent {
    pub fn new(worker_id: Uuid, kind: ConnectivityEventKind, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id,
            kind,
            data,
            created_at: Utc::now(),
        }
    }
}
