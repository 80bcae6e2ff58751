//! RFC 3261 dialog layer.
//!
//! Sits on top of `sipline-transaction-core` as its Transaction User:
//! consumes transaction events, maintains the dialog table keyed by
//! (Call-ID, local tag, remote tag), and owns everything RFC 3261 puts
//! in the UA core rather than a transaction: the ACK to a 2xx, the 2xx
//! retransmission schedule, route sets and CSeq counters, forked-dialog
//! bookkeeping, and early-dialog expiry.
//!
//! Applications drive calls through [`manager::DialogManager`] and react
//! to [`events::DialogEvent`]s.

pub mod config;
pub mod dialog;
pub mod errors;
pub mod events;
pub mod manager;
pub mod routing;

pub use config::DialogConfig;
pub use dialog::{AckGate, Dialog, DialogId, DialogState, EarlyDialogId};
pub use errors::{DialogError, DialogResult};
pub use events::DialogEvent;
pub use manager::DialogManager;
pub use routing::{Hop, NextHopResolver, UriResolver};
