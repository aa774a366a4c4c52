use camstream_media::EngineError;
use thiserror::Error;

use crate::types::{BranchId, StreamId};

/// Fan-out failures.
///
/// Engine errors are structural and never retried; callers turn them into a
/// rejection of the attach request.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("could not add {0} to the graph")]
    GraphInsert(String),

    #[error("branch {0} not found")]
    BranchNotFound(BranchId),

    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    #[error("stream {0} already registered")]
    AlreadyRegistered(StreamId),

    #[error("stream {0} is shut down")]
    ShutDown(StreamId),

    #[error("camera lookup failed: {0}")]
    Lookup(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
