//! RFC 3261 transaction timers.
//!
//! Timers drive retransmission on unreliable transports and bound how
//! long a transaction waits in each state. Timer tasks never hold a
//! reference into a transaction: they carry only the [`TransactionKey`]
//! and resolve the live command sender at fire time through the
//! [`TimerManager`], so a timer outliving its transaction is harmless.
//!
//! [`TransactionKey`]: crate::transaction::TransactionKey

pub mod factory;
pub mod manager;
pub mod types;

pub use factory::{calculate_backoff_interval, TimerFactory};
pub use manager::TimerManager;
pub use types::{TimerSettings, TimerType};
