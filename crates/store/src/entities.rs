use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use seg_core::{ExportJobId, ImageId, ProjectId, QueueItemId, SegmentationId, ShareId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationStatus {
    None,
    Queued,
    Processing,
    Segmented,
    Failed,
}

impl SegmentationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentationStatus::None => "none",
            SegmentationStatus::Queued => "queued",
            SegmentationStatus::Processing => "processing",
            SegmentationStatus::Segmented => "segmented",
            SegmentationStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SegmentationStatus {
    type Err = seg_core::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "segmented" => Ok(Self::Segmented),
            "failed" => Ok(Self::Failed),
            other => Err(seg_core::AppError::Internal(format!(
                "unknown segmentation status {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Queued => "queued",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
            QueueItemStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ExportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportJobStatus::Pending => "pending",
            ExportJobStatus::Processing => "processing",
            ExportJobStatus::Completed => "completed",
            ExportJobStatus::Failed => "failed",
            ExportJobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    Queued,
    Images,
    Visualizations,
    Annotations,
    Metrics,
    Compression,
    Ready,
}

impl ExportPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportPhase::Queued => "queued",
            ExportPhase::Images => "images",
            ExportPhase::Visualizations => "visualizations",
            ExportPhase::Annotations => "annotations",
            ExportPhase::Metrics => "metrics",
            ExportPhase::Compression => "compression",
            ExportPhase::Ready => "ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareStatus {
    Pending,
    Accepted,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Project {
    pub id: ProjectId,
    pub owner_id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Image {
    pub id: ImageId,
    pub project_id: ProjectId,
    pub original_path: String,
    pub thumbnail_path: Option<String>,
    pub segmentation_thumbnail_path: Option<String>,
    pub segmentation_status: String,
    pub created_at: DateTime<Utc>,
}

impl Image {
    pub fn status(&self) -> SegmentationStatus {
        self.segmentation_status.parse().unwrap_or(SegmentationStatus::None)
    }
}

/// A closed ring of 2D points. `is_internal` marks a hole ring that is
/// subtracted from the enclosing external polygon's area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Polygon {
    pub points: Vec<(f64, f64)>,
    pub is_internal: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Segmentation {
    pub id: SegmentationId,
    pub image_id: ImageId,
    pub polygons: Value,
    pub model: String,
    pub confidence_threshold: f32,
    pub processing_duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl Segmentation {
    pub fn polygons_typed(&self) -> Vec<Polygon> {
        serde_json::from_value(self.polygons.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub image_id: ImageId,
    pub model: String,
    pub threshold: f32,
    pub detect_holes: bool,
    pub status: String,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub batch_id: Option<uuid::Uuid>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: ExportJobId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub options: Value,
    pub status: String,
    pub phase: String,
    pub progress: f32,
    pub artifact_path: Option<String>,
    pub checksum_sha256: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProjectShare {
    pub id: ShareId,
    pub project_id: ProjectId,
    pub shared_by_id: UserId,
    pub email: Option<String>,
    pub shared_with_id: Option<UserId>,
    pub share_token: String,
    pub token_expiry: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ProjectShare {
    /// Applies the §12 supplement: a `pending`/`accepted` share whose
    /// `tokenExpiry` has passed is treated as expired-on-read.
    pub fn is_effectively_accepted(&self, now: DateTime<Utc>) -> bool {
        if self.status != "accepted" {
            return false;
        }
        match self.token_expiry {
            Some(expiry) => expiry > now,
            None => true,
        }
    }
}

/// Export options schema, closed set per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    #[serde(default = "default_true")]
    pub include_original_images: bool,
    #[serde(default = "default_true")]
    pub include_visualizations: bool,
    #[serde(default)]
    pub visualization_options: VisualizationOptions,
    #[serde(default)]
    pub annotation_formats: Vec<AnnotationFormat>,
    #[serde(default)]
    pub metrics_formats: Vec<MetricsFormat>,
    #[serde(default)]
    pub include_documentation: bool,
    #[serde(default)]
    pub selected_image_ids: Vec<ImageId>,
    pub pixel_to_micrometer_scale: Option<f64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationOptions {
    #[serde(default = "default_true")]
    pub show_numbers: bool,
    #[serde(default)]
    pub polygon_colors: PolygonColors,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: u8,
    #[serde(default = "default_font_size")]
    pub font_size: u8,
    #[serde(default = "default_transparency")]
    pub transparency: f32,
}

fn default_stroke_width() -> u8 {
    2
}
fn default_font_size() -> u8 {
    16
}
fn default_transparency() -> f32 {
    0.3
}

impl Default for VisualizationOptions {
    fn default() -> Self {
        Self {
            show_numbers: true,
            polygon_colors: PolygonColors::default(),
            stroke_width: default_stroke_width(),
            font_size: default_font_size(),
            transparency: default_transparency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolygonColors {
    #[serde(default = "default_external_color")]
    pub external: String,
    #[serde(default = "default_internal_color")]
    pub internal: String,
}

fn default_external_color() -> String {
    "#FF0000".to_string()
}
fn default_internal_color() -> String {
    "#0000FF".to_string()
}

impl Default for PolygonColors {
    fn default() -> Self {
        Self { external: default_external_color(), internal: default_internal_color() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationFormat {
    Coco,
    Yolo,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    Excel,
    Csv,
    Json,
}

impl ExportOptions {
    pub fn validate(&self) -> seg_core::AppResult<()> {
        if !(1..=10).contains(&self.visualization_options.stroke_width) {
            return Err(seg_core::AppError::InvalidInput(
                "strokeWidth must be in [1,10]".into(),
            ));
        }
        if !(10..=30).contains(&self.visualization_options.font_size) {
            return Err(seg_core::AppError::InvalidInput("fontSize must be in [10,30]".into()));
        }
        if !(0.0..=1.0).contains(&self.visualization_options.transparency) {
            return Err(seg_core::AppError::InvalidInput(
                "transparency must be in [0,1]".into(),
            ));
        }
        if let Some(scale) = self.pixel_to_micrometer_scale {
            if scale <= 0.0 {
                return Err(seg_core::AppError::InvalidInput(
                    "pixelToMicrometerScale must be > 0".into(),
                ));
            }
        }
        for hex in [&self.visualization_options.polygon_colors.external, &self.visualization_options.polygon_colors.internal] {
            if !is_hex_color(hex) {
                return Err(seg_core::AppError::InvalidInput(format!(
                    "invalid color: {hex}"
                )));
            }
        }
        Ok(())
    }
}

fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_export_options_parse_from_empty_json() {
        let opts: ExportOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.include_original_images);
        assert!(opts.include_visualizations);
        assert_eq!(opts.visualization_options.stroke_width, 2);
        assert_eq!(opts.visualization_options.polygon_colors.external, "#FF0000");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn rejects_stroke_width_outside_bounds() {
        let mut opts: ExportOptions = serde_json::from_str("{}").unwrap();
        opts.visualization_options.stroke_width = 20;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_malformed_hex_color() {
        let mut opts: ExportOptions = serde_json::from_str("{}").unwrap();
        opts.visualization_options.polygon_colors.external = "red".to_string();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn share_with_expired_token_is_not_effectively_accepted() {
        let share = ProjectShare {
            id: ShareId::new(),
            project_id: ProjectId::new(),
            shared_by_id: UserId::new(),
            email: None,
            shared_with_id: Some(UserId::new()),
            share_token: "t".into(),
            token_expiry: Some(Utc::now() - chrono::Duration::days(1)),
            status: "accepted".into(),
            created_at: Utc::now(),
        };
        assert!(!share.is_effectively_accepted(Utc::now()));
    }
}
