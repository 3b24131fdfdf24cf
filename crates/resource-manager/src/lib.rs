//! Memory budget for resident models
//!
//! [`MemoryManager`] decides whether a model fits, which residents to evict
//! and when to shed load under host memory pressure.

mod memory;
mod monitor;

pub use memory::{
    Admission, LoadedModelEntry, MemoryBudget, MemoryError, MemoryManager, ReleaseHook, Reservation, ResidentModel,
};
pub use monitor::{resolve_ceiling, resolve_ceiling_with, MemoryProbe, PressureWatch, SystemMemoryProbe};
