use thiserror::Error;

use crate::engine::GraphState;

/// Failures reported by a Media Engine.
///
/// These are structural: retrying the same call will not help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("could not create {factory} element {name:?}")]
    ElementCreation { factory: &'static str, name: String },

    #[error("could not create graph {0:?}")]
    GraphCreation(String),

    #[error("could not link {src} to {dst}")]
    Link { src: String, dst: String },

    #[error("could not unlink {src} from {dst}")]
    Unlink { src: String, dst: String },

    #[error("could not request pad {template:?} on {element}")]
    PadRequest { element: String, template: String },

    #[error("{target} refused state change to {state:?}")]
    StateChange { target: String, state: GraphState },

    #[error("unknown handle {0}")]
    UnknownHandle(String),

    #[error("end of stream")]
    EndOfStream,

    #[error("engine failure: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
