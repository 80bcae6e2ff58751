//! Events surfaced by the dialog layer to the application.

use sipline_sip_core::{Request, Response};
use sipline_transaction_core::TransactionKey;

use crate::dialog::{DialogId, DialogState};

/// Notifications emitted by the [`DialogManager`](crate::manager::DialogManager)
/// as dialogs are created, change state, carry traffic, and die.
#[derive(Debug, Clone)]
pub enum DialogEvent {
    /// A new dialog came into existence (locally initiated or from an
    /// incoming request/response).
    Created { dialog_id: DialogId },

    /// The dialog moved between lifecycle states.
    StateChanged {
        dialog_id: DialogId,
        previous: DialogState,
        current: DialogState,
    },

    /// A forked INVITE produced an additional dialog beyond the one the
    /// original transaction established.
    ForkedDialogCreated {
        dialog_id: DialogId,
        original: DialogId,
    },

    /// A request arrived and is awaiting an application response via the
    /// named server transaction. `dialog_id` is `None` for out-of-dialog
    /// requests that establish no dialog (OPTIONS, MESSAGE).
    RequestReceived {
        dialog_id: Option<DialogId>,
        transaction_key: TransactionKey,
        request: Request,
    },

    /// The peer cancelled a pending INVITE on this dialog.
    CancelReceived {
        dialog_id: DialogId,
        cancel: Request,
    },

    /// A response arrived for an in-dialog client transaction.
    ResponseReceived {
        dialog_id: DialogId,
        transaction_key: TransactionKey,
        response: Response,
    },

    /// An ACK arrived for a 2xx this side sent.
    AckReceived { dialog_id: DialogId },

    /// An early dialog never confirmed within the configured window.
    EarlyTimeout { dialog_id: DialogId },

    /// The peer never acknowledged our 2xx; the dialog was torn down.
    AckNotReceived { dialog_id: DialogId },

    /// The application never sent the ACK it owed for a received 2xx.
    AckNotSent { dialog_id: DialogId },

    /// The dialog is gone.
    Terminated { dialog_id: DialogId, reason: String },

    /// A non-fatal error tied to a specific dialog, or a global one
    /// when `dialog_id` is `None`.
    Error {
        dialog_id: Option<DialogId>,
        error: String,
    },
}
