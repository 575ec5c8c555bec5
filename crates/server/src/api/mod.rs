pub mod doc;
pub mod export;
pub mod health;
pub mod segmentation;
pub mod stats;
