//! Fine-tune a pretrained ResNet-50 on a folder-structured image dataset
//! with mixed-precision training.
//!
//! Expected dataset layout:
//!
//! ```text
//! data_root/
//!   train/
//!     class_a/*.jpg
//!     class_b/*.jpg
//!   val/
//!     class_a/*.jpg
//!     class_b/*.jpg
//! ```
//!
//! Run:
//!
//! ```text
//! clsfr-trnr --data-root /path/to/data --pretrained weights/resnet50.safetensors
//! ```

pub mod amp;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod model;
pub mod sched;
pub mod trainer;

pub use checkpoint::{BestTracker, CheckpointMeta};
pub use config::TrainConfig;
pub use trainer::{FineTuner, TrainSummary};
