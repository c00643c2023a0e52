use thiserror::Error;
use weft_switch::SwitchError;

/// Errors that can occur in the node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {reason}")]
    Config { reason: String },

    #[error("switch error: {0}")]
    Switch(#[from] SwitchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
