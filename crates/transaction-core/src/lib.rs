//! RFC 3261 transaction layer.
//!
//! This crate implements the four transaction state machines of RFC 3261
//! section 17 (client/server x INVITE/non-INVITE), their retransmission
//! and timeout timers, and the stack-level registry that matches inbound
//! messages to transactions, detects merged requests, and applies
//! admission control.
//!
//! Architecture: every live transaction is one tokio task running the
//! generic loop in [`transaction::runner`], with kind-specific behavior
//! behind the [`transaction::logic::TransactionLogic`] trait. The
//! [`manager::TransactionManager`] owns the tables and is the only
//! ingress/egress point; the Transaction User (typically the dialog
//! layer) consumes [`transaction::TransactionEvent`]s from the channel
//! the manager hands out at construction.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sipline_sip_transport::MockTransport;
//! use sipline_transaction_core::manager::{TransactionManager, TransactionManagerConfig};
//!
//! # async fn example() {
//! let transport = MockTransport::udp();
//! let (manager, mut events) =
//!     TransactionManager::new(transport, TransactionManagerConfig::default());
//! // Feed parsed messages into manager.handle_message(...), drive the
//! // TU from `events`.
//! # }
//! ```

pub mod client;
pub mod error;
pub mod gate;
pub mod manager;
pub mod server;
pub mod timer;
pub mod transaction;
pub mod utils;

pub use error::{Error, RejectReason, Result};
pub use gate::DeliveryGate;
pub use manager::{TransactionManager, TransactionManagerConfig};
pub use timer::{TimerSettings, TimerType};
pub use transaction::{
    MergeId, TransactionEvent, TransactionKey, TransactionKind, TransactionState,
};
