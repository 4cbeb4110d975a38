//! Error types for the command bridge

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    // Transport errors: terminate the offending connection, never the process
    #[error("Frame too large: {declared} bytes (max {max})")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("Incomplete frame: stream closed mid-message")]
    IncompleteFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Protocol errors: returned as {error}, connection continues
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    // Request-local failures
    #[error("{0}")]
    Handler(String),

    #[error("GUI thread did not answer within {}ms", .0.as_millis())]
    GuiTimeout(Duration),

    #[error("GUI task queue is full ({0} pending), retry later")]
    Backpressure(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid selection: {0}")]
    SelectionInvalid(String),
}

impl BridgeError {
    /// Get error code for logging and stats
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            BridgeError::IncompleteFrame => "INCOMPLETE_FRAME",
            BridgeError::Io(_) => "IO_ERROR",
            BridgeError::InvalidRequest(_) => "INVALID_REQUEST",
            BridgeError::UnknownTool(_) => "UNKNOWN_TOOL",
            BridgeError::Handler(_) => "HANDLER_ERROR",
            BridgeError::GuiTimeout(_) => "GUI_TIMEOUT",
            BridgeError::Backpressure(_) => "BACKPRESSURE",
            BridgeError::NotFound(_) => "NOT_FOUND",
            BridgeError::Cancelled => "CANCELLED",
            BridgeError::SelectionInvalid(_) => "SELECTION_INVALID",
        }
    }
}
