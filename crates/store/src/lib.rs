pub mod entities;
pub mod export_jobs;
pub mod images;
pub mod pool;
pub mod projects;
pub mod queue_items;
pub mod retry;
pub mod segmentations;
pub mod shares;

pub use entities::*;
pub use export_jobs::ExportJobStore;
pub use images::ImageStore;
pub use pool::StorePool;
pub use projects::ProjectStore;
pub use queue_items::{NewQueueItem, QueueItemStore};
pub use retry::with_serializable_retry;
pub use segmentations::SegmentationStore;
pub use shares::ShareStore;
