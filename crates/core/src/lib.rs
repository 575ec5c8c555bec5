pub mod config;
pub mod error;
pub mod events;
pub mod ids;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use ids::{ExportJobId, ImageId, ProjectId, QueueItemId, SegmentationId, ShareId, UserId};
