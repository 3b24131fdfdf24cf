//! Acquisition state
//!
//! State of a single model acquisition as seen by observers.

use std::fmt;
use thiserror::Error;

use common::error::LifecycleError;
use common::types::LifecycleStage;

use crate::progress::OverallProgress;

/// Represents the current state of an acquisition
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    /// Looking the model up in the registry
    Discovery,

    /// Fetching artifacts
    Downloading,

    /// Unpacking an archive
    Extracting,

    /// Checking the artifact
    Validating,

    /// Selecting an adapter and checking requirements
    Initializing,

    /// Admitting and loading the model
    Loading,

    /// The model is resident and usable
    Ready,

    /// A stage failed
    Failed { stage: LifecycleStage, error: LifecycleError },

    /// A caller cancelled the acquisition
    Cancelled,
}

impl LifecycleState {
    /// State that represents a running stage
    pub fn for_stage(stage: LifecycleStage) -> Self {
        match stage {
            LifecycleStage::Discovery => LifecycleState::Discovery,
            LifecycleStage::Downloading => LifecycleState::Downloading,
            LifecycleStage::Extracting => LifecycleState::Extracting,
            LifecycleStage::Validating => LifecycleState::Validating,
            LifecycleStage::Initializing => LifecycleState::Initializing,
            LifecycleStage::Loading => LifecycleState::Loading,
        }
    }

    /// Stage this state belongs to; `None` for terminal states
    pub fn stage(&self) -> Option<LifecycleStage> {
        match self {
            LifecycleState::Discovery => Some(LifecycleStage::Discovery),
            LifecycleState::Downloading => Some(LifecycleStage::Downloading),
            LifecycleState::Extracting => Some(LifecycleStage::Extracting),
            LifecycleState::Validating => Some(LifecycleStage::Validating),
            LifecycleState::Initializing => Some(LifecycleStage::Initializing),
            LifecycleState::Loading => Some(LifecycleStage::Loading),
            _ => None,
        }
    }

    /// Returns true once no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Ready | LifecycleState::Failed { .. } | LifecycleState::Cancelled
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LifecycleState::Failed { .. })
    }

    /// Gets the failure cause if failed
    pub fn error(&self) -> Option<&LifecycleError> {
        match self {
            LifecycleState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Ready => write!(f, "Ready"),
            LifecycleState::Cancelled => write!(f, "Cancelled"),
            LifecycleState::Failed { stage, error } => write!(f, "Failed at {}: {}", stage, error),
            running => match running.stage() {
                Some(stage) => write!(f, "{}", stage),
                None => Ok(()),
            },
        }
    }
}

/// What observers of an acquisition receive
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSnapshot {
    pub state: LifecycleState,
    pub progress: OverallProgress,
}

/// Terminal failure of an acquisition
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquireError {
    /// A stage failed
    #[error("acquisition of {model_id} failed at {stage} after {attempts} attempt(s): {cause}")]
    Failed {
        model_id: String,
        stage: LifecycleStage,
        attempts: u32,
        cause: LifecycleError,
    },

    /// The acquisition was cancelled
    #[error("acquisition of {0} was cancelled")]
    Cancelled(String),
}

impl AcquireError {
    /// Stage that failed, if any
    pub fn stage(&self) -> Option<LifecycleStage> {
        match self {
            AcquireError::Failed { stage, .. } => Some(*stage),
            AcquireError::Cancelled(_) => None,
        }
    }

    /// Failure cause; `Cancelled` for a cancelled acquisition
    pub fn cause(&self) -> LifecycleError {
        match self {
            AcquireError::Failed { cause, .. } => cause.clone(),
            AcquireError::Cancelled(_) => LifecycleError::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcquireError::Cancelled(_))
    }
}
