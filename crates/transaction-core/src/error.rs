//! Error taxonomy for the transaction layer.
//!
//! Network-triggered conditions are explicit values here; they drive state
//! transitions and TU events, never panics. Invariant violations inside the
//! engine (caller contract breaches) are the only thing allowed to panic.

use sipline_sip_core::StatusCode;

use crate::transaction::{TransactionKey, TransactionKind, TransactionState};

/// Why an inbound message was rejected at ingress before table lookup.
///
/// Each reason maps to the best-effort error response the engine answers
/// with when the peer can receive one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A mandatory header (From/To/Call-ID/CSeq/Via) is absent.
    MissingHeader(&'static str),
    /// Message body exceeds the configured maximum.
    MessageTooLarge { size: usize, limit: usize },
    /// CSeq method does not agree with the request method.
    CSeqMethodMismatch,
    /// SIP version other than 2.0.
    UnsupportedVersion,
}

impl RejectReason {
    /// Status code for the best-effort error response, when one applies.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RejectReason::MissingHeader(_) => StatusCode::BAD_REQUEST,
            RejectReason::MessageTooLarge { .. } => StatusCode::REQUEST_ENTITY_TOO_LARGE,
            RejectReason::CSeqMethodMismatch => StatusCode::BAD_REQUEST,
            RejectReason::UnsupportedVersion => StatusCode::VERSION_NOT_SUPPORTED,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingHeader(name) => write!(f, "missing mandatory header {}", name),
            RejectReason::MessageTooLarge { size, limit } => {
                write!(f, "message body {} bytes exceeds limit {}", size, limit)
            }
            RejectReason::CSeqMethodMismatch => f.write_str("CSeq method mismatch"),
            RejectReason::UnsupportedVersion => f.write_str("unsupported SIP version"),
        }
    }
}

/// Errors produced by the transaction layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The transport collaborator failed to deliver a message. Always
    /// terminates the owning transaction.
    #[error("transport failure: {context}")]
    TransportFailure { context: String },

    /// RFC 3261 forbids this transition for this transaction kind.
    #[error("invalid state transition for {kind:?}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        kind: TransactionKind,
        from: TransactionState,
        to: TransactionState,
    },

    /// Inbound message failed ingress validation and was dropped.
    #[error("message rejected: {reason}")]
    MessageRejected { reason: RejectReason },

    /// Merge-table hit: the same request arrived via two paths
    /// (RFC 3261 section 8.2.2.2); answer 482.
    #[error("merged request detected for transaction {key}")]
    LoopDetected { key: TransactionKey },

    /// A transaction with this key already exists.
    #[error("transaction {key} already exists")]
    TransactionExists { key: TransactionKey },

    #[error("transaction {key} not found")]
    TransactionNotFound { key: TransactionKey },

    /// Admission control refused a new client transaction.
    #[error("transaction table above high watermark, creation refused")]
    Overloaded,

    /// The request carries no Via branch and no legacy key could be
    /// computed from it.
    #[error("message carries no usable transaction identifier")]
    NoTransactionId,

    /// A command or event channel closed while the transaction was live.
    #[error("transaction channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn transport_error(source: impl std::fmt::Display, context: &str) -> Self {
        Error::TransportFailure {
            context: format!("{}: {}", context, source),
        }
    }

    pub fn invalid_state_transition(
        kind: TransactionKind,
        from: TransactionState,
        to: TransactionState,
    ) -> Self {
        Error::InvalidStateTransition { kind, from, to }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reasons_map_to_status_codes() {
        assert_eq!(
            RejectReason::MissingHeader("CSeq").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RejectReason::MessageTooLarge {
                size: 100_000,
                limit: 65_536
            }
            .status_code(),
            StatusCode::REQUEST_ENTITY_TOO_LARGE
        );
        assert_eq!(
            RejectReason::UnsupportedVersion.status_code(),
            StatusCode::VERSION_NOT_SUPPORTED
        );
    }
}
