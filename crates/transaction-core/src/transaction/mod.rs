//! Core transaction vocabulary: kinds, states, keys, events, and the
//! internal command protocol every transaction task speaks.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use sipline_sip_core::{Message, Request, Response};

pub mod key;
pub mod logic;
pub mod runner;
pub mod state;
pub mod validators;

pub use key::{MergeId, TransactionKey};
pub use runner::{AsRefKey, AsRefState, HasCommandSender, HasTransactionEvents, HasTransport};
pub use state::{AtomicTransactionState, TransactionState};

/// The four RFC 3261 transaction state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl TransactionKind {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionKind::InviteClient | TransactionKind::NonInviteClient
        )
    }

    pub fn is_server(&self) -> bool {
        !self.is_client()
    }

    pub fn is_invite(&self) -> bool {
        matches!(
            self,
            TransactionKind::InviteClient | TransactionKind::InviteServer
        )
    }
}

/// Events the transaction layer reports to the Transaction User.
///
/// Response events carry the transaction key and the response itself; the
/// TU correlates them with dialogs. `StrayResponse` and `StrayAck` cover
/// messages that match no live transaction but are still meaningful to the
/// TU (forked 2xx after transaction termination, ACK to a 2xx).
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// A transaction moved between states.
    StateChanged {
        transaction_id: TransactionKey,
        previous_state: TransactionState,
        new_state: TransactionState,
    },

    /// 1xx received by a client transaction.
    ProvisionalResponse {
        transaction_id: TransactionKey,
        response: Response,
    },

    /// 2xx received by a client transaction. `remote_addr` is the source,
    /// kept so the TU can address the ACK it now owns.
    SuccessResponse {
        transaction_id: TransactionKey,
        response: Response,
        remote_addr: SocketAddr,
    },

    /// 3xx-6xx received by a client transaction.
    FailureResponse {
        transaction_id: TransactionKey,
        response: Response,
    },

    /// ACK received by an INVITE server transaction for its non-2xx final.
    AckReceived {
        transaction_id: TransactionKey,
        request: Request,
    },

    /// PRACK received that acknowledges a reliable provisional sent by an
    /// INVITE server transaction.
    PrackReceived {
        transaction_id: TransactionKey,
        request: Request,
    },

    /// CANCEL received that targets a live INVITE server transaction. The
    /// CANCEL itself is answered by its own non-INVITE server transaction;
    /// this event tells the TU to decide the INVITE's fate.
    CancelReceived {
        transaction_id: TransactionKey,
        cancel_request: Request,
    },

    /// A request that created a new server transaction. The TU must
    /// respond through the returned handle.
    NewRequest {
        transaction_id: TransactionKey,
        request: Request,
        source: SocketAddr,
    },

    /// A response that matched no client transaction. Typically a forked
    /// or retransmitted 2xx arriving after the transaction terminated; the
    /// dialog layer absorbs these.
    StrayResponse {
        response: Response,
        source: SocketAddr,
    },

    /// An ACK that matched no server transaction: the ACK to a 2xx, which
    /// RFC 3261 routes directly to the TU.
    StrayAck {
        request: Request,
        source: SocketAddr,
    },

    /// The transaction gave up waiting (Timer B, F, or H exhausted).
    TransactionTimeout {
        transaction_id: TransactionKey,
        kind: TransactionKind,
    },

    /// The transport failed while the transaction tried to send.
    TransportError { transaction_id: TransactionKey },

    /// The transaction reached Terminated; the registry may reap it.
    TransactionTerminated { transaction_id: TransactionKey },

    /// Non-fatal error surfaced to the TU.
    Error {
        transaction_id: Option<TransactionKey>,
        error: String,
    },
}

/// Commands delivered to a transaction's event loop over its private
/// channel. Everything that happens to a transaction arrives as one of
/// these, so the loop is the single writer of transaction state.
#[derive(Debug, Clone)]
pub enum InternalTransactionCommand {
    /// Request a state transition (validated against the machine).
    TransitionTo(TransactionState),
    /// An inbound message matched this transaction.
    ProcessMessage(Message),
    /// A named timer fired.
    Timer(String),
    /// The transport reported a failure for this transaction's sends.
    TransportError,
    /// Tear the transaction down immediately.
    Terminate,
}
