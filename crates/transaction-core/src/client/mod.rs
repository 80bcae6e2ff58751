//! Client transactions (RFC 3261 section 17.1).

mod invite;
mod non_invite;

pub use invite::InviteClientLogic;
pub use non_invite::NonInviteClientLogic;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use sipline_sip_core::{Message, Request, Response};
use sipline_sip_transport::Transport;

use crate::error::{Error, Result};
use crate::timer::TimerFactory;
use crate::transaction::logic::TransactionLogic;
use crate::transaction::runner::{
    run_transaction_loop, AsRefKey, AsRefState, HasCommandSender, HasTransactionEvents,
    HasTransport,
};
use crate::transaction::{
    AtomicTransactionState, InternalTransactionCommand, TransactionEvent, TransactionKey,
    TransactionState,
};

/// Shared data for a client transaction, owned by the transaction task and
/// the registry.
#[derive(Debug)]
pub struct ClientTransactionData {
    pub(crate) state: Arc<AtomicTransactionState>,
    pub(crate) key: TransactionKey,
    pub(crate) request: Request,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events_tx: mpsc::Sender<TransactionEvent>,
    pub(crate) cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    pub(crate) timer_factory: TimerFactory,
    /// Iterations of the retransmission timer (A or E) so far.
    pub(crate) retransmit_count: AtomicU32,
    /// Last final response seen; the INVITE machine re-ACKs from it.
    pub(crate) last_response: Mutex<Option<Response>>,
}

impl ClientTransactionData {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: TransactionKey,
        request: Request,
        remote_addr: SocketAddr,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::Sender<TransactionEvent>,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
        timer_factory: TimerFactory,
    ) -> Self {
        Self {
            state: Arc::new(AtomicTransactionState::new(TransactionState::Initial)),
            key,
            request,
            remote_addr,
            transport,
            events_tx,
            cmd_tx,
            timer_factory,
            retransmit_count: AtomicU32::new(0),
            last_response: Mutex::new(None),
        }
    }

    pub(crate) async fn send_request_to_peer(&self) -> Result<()> {
        self.transport
            .send_message(Message::Request(self.request.clone()), self.remote_addr)
            .await
            .map_err(|e| Error::transport_error(e, "failed to send request"))
    }

    pub(crate) fn reset_retransmit_count(&self) {
        self.retransmit_count.store(0, Ordering::SeqCst);
    }

    /// Bump the retransmission counter, returning the value before the
    /// bump (the backoff iteration for the timer just being rescheduled).
    pub(crate) fn next_retransmit_iteration(&self) -> u32 {
        self.retransmit_count.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }
}

impl AsRefState for ClientTransactionData {
    fn as_ref_state(&self) -> &Arc<AtomicTransactionState> {
        &self.state
    }
}

impl AsRefKey for ClientTransactionData {
    fn as_ref_key(&self) -> &TransactionKey {
        &self.key
    }
}

impl HasTransactionEvents for ClientTransactionData {
    fn get_tu_event_sender(&self) -> mpsc::Sender<TransactionEvent> {
        self.events_tx.clone()
    }
}

impl HasTransport for ClientTransactionData {
    fn get_transport_layer(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

impl HasCommandSender for ClientTransactionData {
    fn get_self_command_sender(&self) -> mpsc::Sender<InternalTransactionCommand> {
        self.cmd_tx.clone()
    }
}

/// Active timers of a client transaction. Entering a new state cancels
/// them wholesale before the new state rearms what it needs.
#[derive(Debug, Default)]
pub struct ClientTimerHandles {
    /// Timer A (INVITE) or E (non-INVITE).
    pub retransmit: Option<JoinHandle<()>>,
    /// Timer B (INVITE) or F (non-INVITE).
    pub timeout: Option<JoinHandle<()>>,
    /// Timer D (INVITE) or K (non-INVITE).
    pub wait: Option<JoinHandle<()>>,
}

impl ClientTimerHandles {
    pub fn abort_all(&mut self) {
        for handle in [
            self.retransmit.take(),
            self.timeout.take(),
            self.wait.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Spawn the event loop task for a client transaction.
pub(crate) fn spawn_client_loop<L>(
    data: Arc<ClientTransactionData>,
    logic: Arc<L>,
    cmd_rx: mpsc::Receiver<InternalTransactionCommand>,
) -> JoinHandle<()>
where
    L: TransactionLogic<ClientTransactionData, ClientTimerHandles> + 'static,
{
    tokio::spawn(run_transaction_loop::<ClientTransactionData, ClientTimerHandles, L>(
        data, logic, cmd_rx,
    ))
}
