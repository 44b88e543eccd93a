//! Error types for weather-worker.

use thiserror::Error;

use crate::model::{StartupStage, WorkerState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("{stage} failed: {source}")]
    Startup {
        stage: StartupStage,
        source: Box<Error>,
    },

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("operation not allowed while worker is {0}")]
    InvalidState(WorkerState),

    #[error("startup cancelled by termination request")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The startup stage that failed, if this is a fatal startup error.
    pub fn startup_stage(&self) -> Option<StartupStage> {
        match self {
            Error::Startup { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
