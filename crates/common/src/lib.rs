//! Common utilities and types for the model lifecycle runtime
//!
//! This crate provides shared functionality used across the workspace,
//! including error types, model descriptors, lifecycle stages and utility functions.

pub mod error;
pub mod models;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, LifecycleError, Result};
pub use models::*;
pub use types::*;
