//! The seam between the generic event loop and the four state machines.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sipline_sip_core::Message;

use crate::error::Result;
use crate::transaction::{InternalTransactionCommand, TransactionKind, TransactionState};

/// Transaction-kind-specific behavior plugged into
/// [`run_transaction_loop`](crate::transaction::runner::run_transaction_loop).
///
/// `D` is the shared per-transaction data, `TH` holds the `JoinHandle`s of
/// the timers this kind uses so entering a new state can cancel the old
/// ones wholesale.
#[async_trait]
pub trait TransactionLogic<D, TH>: Send + Sync
where
    TH: Default + Send,
{
    /// Which of the four machines this logic implements.
    fn kind(&self) -> TransactionKind;

    /// Abort every timer currently tracked in `timer_handles`. Called on
    /// each state transition and at loop teardown.
    fn cancel_all_specific_timers(&self, timer_handles: &mut TH);

    /// React to entering `new_state`: send or retransmit as the machine
    /// requires and start the timers the new state prescribes.
    async fn on_enter_state(
        &self,
        data: &Arc<D>,
        new_state: TransactionState,
        previous_state: TransactionState,
        timer_handles: &mut TH,
        self_sender: mpsc::Sender<InternalTransactionCommand>,
    ) -> Result<()>;

    /// Process a message matched to this transaction in `current_state`.
    /// Returns the state to transition to, if any.
    async fn process_message(
        &self,
        data: &Arc<D>,
        message: Message,
        current_state: TransactionState,
        timer_handles: &mut TH,
    ) -> Result<Option<TransactionState>>;

    /// Handle a named timer firing in `current_state`. Returns the state
    /// to transition to, if any.
    async fn handle_timer(
        &self,
        data: &Arc<D>,
        timer_name: &str,
        current_state: TransactionState,
        timer_handles: &mut TH,
    ) -> Result<Option<TransactionState>>;
}
