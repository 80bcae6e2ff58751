//! Error types for the dialog layer.

use crate::dialog::DialogId;

/// Errors produced by dialog operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DialogError {
    #[error("dialog {id} not found")]
    DialogNotFound { id: DialogId },

    /// The operation is not legal in the dialog's current state.
    #[error("invalid dialog state: {context}")]
    InvalidState { context: String },

    /// The peer violated dialog sequencing (stale CSeq, unexpected tag).
    #[error("protocol error: {context}")]
    ProtocolError { context: String },

    /// The ACK gate could not be acquired within its bound; a previous
    /// re-INVITE's ACK is still outstanding.
    #[error("previous re-INVITE not yet acknowledged")]
    AckPending,

    /// The dialog never sent the ACK it owes for a 2xx.
    #[error("ACK for dialog {id} was never sent")]
    AckNotSent { id: DialogId },

    /// The peer never acknowledged our 2xx within the configured bound.
    #[error("ACK for dialog {id} was never received")]
    AckNotReceived { id: DialogId },

    /// Next-hop resolution failed for an outbound request.
    #[error("routing failed: {context}")]
    RoutingError { context: String },

    #[error("transaction layer error: {0}")]
    TransactionError(#[from] sipline_transaction_core::Error),

    #[error("dialog event channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl DialogError {
    pub fn protocol_error(context: impl Into<String>) -> Self {
        DialogError::ProtocolError {
            context: context.into(),
        }
    }

    pub fn invalid_state(context: impl Into<String>) -> Self {
        DialogError::InvalidState {
            context: context.into(),
        }
    }

    pub fn routing_error(context: impl Into<String>) -> Self {
        DialogError::RoutingError {
            context: context.into(),
        }
    }
}

pub type DialogResult<T> = std::result::Result<T, DialogError>;
