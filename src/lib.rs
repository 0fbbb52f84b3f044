pub mod assembler;
pub mod category;
pub mod config;
pub mod events;
pub mod fetcher;
pub mod integrity;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod segmenter;
pub mod speed;
pub mod state_manager;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::category::Category;
    pub use crate::config::EngineConfig;
    pub use crate::events::{DownloadEvent, ProgressUpdate};
    pub use crate::integrity::{ChecksumAlgorithm, ChecksumSpec};
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{DownloadId, DownloadJob, DownloadOptions, FailureReason, JobStatus, Priority};
    pub use crate::retry::RetryPolicy;
    pub use crate::state_manager::StateManager;
}
