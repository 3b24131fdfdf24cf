//! Inference adapters for the model lifecycle runtime
//!
//! This crate maps verified model artifacts into memory on behalf of the
//! framework that will run them.

pub mod adapter;
pub mod service;

// Re-export commonly used types
pub use adapter::{AdapterError, AdapterSet, InferenceAdapter};
pub use service::ModelService;
