//! The closed set of realtime event names and payloads from §6,
//! shared between the bus, queue, export, and stats engines so every
//! producer emits the same wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ExportJobId, ImageId, ProjectId, QueueItemId, UserId};

/// One room a session can join. Membership is a set of session handles
/// per §4.5; the bus never persists events, only routes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Room {
    User(UserId),
    Project(ProjectId),
    Batch(uuid::Uuid),
    Export(ExportJobId),
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{id}"),
            Room::Project(id) => write!(f, "project:{id}"),
            Room::Batch(id) => write!(f, "batch:{id}"),
            Room::Export(id) => write!(f, "export:{id}"),
        }
    }
}

/// Envelope around every event: name from the closed set, a JSON payload,
/// and a server timestamp, matching `live.rs`'s `WsMessage<T>` wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: &'static str,
    pub payload: Value,
    pub server_time: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event: &'static str, payload: impl Serialize) -> Self {
        Self {
            event,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            server_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationStatusEvent {
    pub image_id: ImageId,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationUpdateEvent {
    pub image_id: ImageId,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationProgressEvent {
    pub image_id: ImageId,
    pub queue_item_id: QueueItemId,
    pub stage: String,
    pub progress: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationCompletedEvent {
    pub image_id: ImageId,
    pub queue_item_id: QueueItemId,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationFailedEvent {
    pub image_id: ImageId,
    pub queue_item_id: QueueItemId,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsEvent {
    pub project_id: ProjectId,
    pub queued: u32,
    pub processing: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueUpdateEvent {
    pub project_id: ProjectId,
    pub added: Vec<QueueItemId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportProgressEvent {
    pub job_id: ExportJobId,
    pub phase: String,
    pub progress: f32,
    pub stage: Option<String>,
    pub stage_progress: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportTerminalEvent {
    pub job_id: ExportJobId,
    pub code: Option<String>,
    pub message: Option<String>,
}

pub mod event_names {
    pub const SEGMENTATION_STATUS: &str = "segmentationStatus";
    pub const SEGMENTATION_UPDATE: &str = "segmentationUpdate";
    pub const SEGMENTATION_PROGRESS: &str = "segmentationProgress";
    pub const SEGMENTATION_COMPLETED: &str = "segmentationCompleted";
    pub const SEGMENTATION_FAILED: &str = "segmentationFailed";
    pub const QUEUE_STATS: &str = "queueStats";
    pub const QUEUE_UPDATE: &str = "queueUpdate";
    pub const QUEUE_POSITION: &str = "queuePosition";
    pub const UPLOAD_PROGRESS: &str = "uploadProgress";
    pub const UPLOAD_COMPLETED: &str = "uploadCompleted";
    pub const UPLOAD_FAILED: &str = "uploadFailed";
    pub const PROJECT_UPDATE: &str = "projectUpdate";
    pub const PROJECT_STATS_UPDATE: &str = "projectStatsUpdate";
    pub const DASHBOARD_METRICS_UPDATE: &str = "dashboardMetricsUpdate";
    pub const SHARED_PROJECT_UPDATE: &str = "sharedProjectUpdate";
    pub const EXPORT_STARTED: &str = "export:started";
    pub const EXPORT_PROGRESS: &str = "export:progress";
    pub const EXPORT_PHASE_CHANGED: &str = "export:phase-changed";
    pub const EXPORT_COMPLETED: &str = "export:completed";
    pub const EXPORT_FAILED: &str = "export:failed";
    pub const EXPORT_CANCELLED: &str = "export:cancelled";
    pub const ERROR: &str = "error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_display_uses_colon_separated_prefix() {
        let uid = UserId::new();
        assert_eq!(Room::User(uid).to_string(), format!("user:{uid}"));
    }

    #[test]
    fn envelope_serializes_with_server_time() {
        let env = Envelope::new(
            event_names::QUEUE_STATS,
            QueueStatsEvent { project_id: ProjectId::new(), queued: 0, processing: 0 },
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("queueStats"));
        assert!(json.contains("server_time"));
    }
}
