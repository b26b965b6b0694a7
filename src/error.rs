use thiserror::Error;
use uuid::Uuid;

use crate::docker::DockerError;
use crate::store::StoreError;
use crate::task::State;

#[derive(Error, Debug)]
pub enum CubeError {
    #[error("no candidate nodes match the resource request for task {0}")]
    NoCandidates(Uuid),

    #[error("no scores returned for task {0}")]
    NoScores(Uuid),

    #[error("invalid state transition from {0} to {1}")]
    InvalidTransition(State, State),

    #[error("driver error: {0}")]
    Driver(#[from] DockerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unable to fetch stats from node {node}: {reason}")]
    NodeStats { node: String, reason: String },

    #[error("health check for task {task_id} failed: {reason}")]
    HealthCheck { task_id: Uuid, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CubeError>;
