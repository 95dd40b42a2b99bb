use chrono::{DateTime, Utc};
use serde::Serialize;

pub mod mint;
pub mod withdraw;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

/// Snapshot consumed by the ops surface through `/health`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub worker: String,
    pub status: WorkerStatus,
    pub consumers: usize,
    pub timestamp: DateTime<Utc>,
}

impl WorkerHealth {
    pub fn snapshot(worker: &str, consumers: usize) -> Self {
        WorkerHealth {
            worker: worker.to_string(),
            status: if consumers > 0 {
                WorkerStatus::Running
            } else {
                WorkerStatus::Stopped
            },
            consumers,
            timestamp: Utc::now(),
        }
    }
}
