//! Control layer for a generative-audio studio: pipeline stage graphs,
//! flat/stage conversion, task completion tracking and result history.

pub mod api;
pub mod channel;
pub mod config;
pub mod convert;
pub mod error;
pub mod graph;
pub mod push;
pub mod results;
pub mod stage;
pub mod studio;
pub mod types;

pub use channel::{ChannelConfig, TaskChannel, TaskEvent, TaskHandle, TerminalOutcome};
pub use error::{ApiError, GraphError};
pub use graph::{PipelineGraph, StagePatch};
pub use results::{Batch, RecordOutcome, ResultAggregator};
pub use stage::{StageConfig, StageKind};
pub use studio::{Studio, StudioOutcome};
