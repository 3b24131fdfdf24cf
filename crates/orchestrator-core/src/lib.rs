//! Model lifecycle orchestration
//!
//! This crate ties the registry, download orchestrator, validation gate,
//! memory manager and inference adapters together into a per-model
//! acquisition state machine.

pub mod lifecycle;
pub mod progress;
pub mod state;

// Re-export commonly used types
pub use lifecycle::{AcquisitionHandle, LifecycleOrchestrator, LoadedModel};
pub use progress::{OverallProgress, ProgressTracker, STAGE_WEIGHTS};
pub use state::{AcquireError, AcquisitionSnapshot, LifecycleState};
