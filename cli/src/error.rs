//! Error types for the remote service client and the stage graph.

use thiserror::Error;

use crate::stage::StageKind;

/// Errors raised while talking to the generation service.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service responded with status {status}: {body}")]
    Status { status: u16, body: String },

    /// The status endpoint does not know this task id.
    #[error("task {0} not found")]
    TaskNotFound(String),

    /// The response envelope carried `success: false`.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The body could not be decoded into the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The push websocket failed.
    #[error("push channel error: {0}")]
    Push(String),

    #[error("invalid url: {0}")]
    Url(String),
}

impl ApiError {
    /// Whether this error means the remote task itself is gone, as opposed
    /// to a transient transport problem.
    pub fn is_task_missing(&self) -> bool {
        matches!(self, Self::TaskNotFound(_))
    }
}

/// Validation failures for pipeline graph operations. A rejected operation
/// leaves the graph untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("a pipeline needs at least one stage")]
    Empty,

    #[error("cannot remove the last remaining stage")]
    LastStage,

    #[error("stage {index} does not exist (pipeline has {len} stages)")]
    OutOfRange { index: usize, len: usize },

    #[error("stage {index} needs an uploaded audio or a source stage")]
    MissingAudioSource { index: usize },

    #[error("stage {index} references stage {reference}, which is not a previous stage")]
    DanglingReference { index: usize, reference: usize },

    #[error("stage {index} is a refine stage with no previous stage to refine")]
    MissingInputStage { index: usize },

    #[error("stage {index}: src_audio_id and src_stage are mutually exclusive")]
    ConflictingAudioSource { index: usize },

    #[error("stage {index} ({kind}) does not take an audio source")]
    NoAudioSource { index: usize, kind: StageKind },

    #[error("stage {index}: track name is required")]
    MissingTrackName { index: usize },

    #[error("stage {index} requires a base model, got '{model}'")]
    RequiresBaseModel { index: usize, model: String },
}
