//! Dialog identity, state, and the dialog value object.

pub mod ack_gate;
pub mod dialog_id;
pub mod dialog_impl;
pub mod dialog_state;

pub use ack_gate::AckGate;
pub use dialog_id::{DialogId, EarlyDialogId};
pub use dialog_impl::Dialog;
pub use dialog_state::DialogState;
