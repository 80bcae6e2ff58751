//! Server transactions (RFC 3261 section 17.2).

mod invite;
mod non_invite;

pub use invite::InviteServerLogic;
pub use non_invite::NonInviteServerLogic;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use sipline_sip_core::{Message, RAck, Request, Response};
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

/// RFC 3262 reliable-provisional bookkeeping for an INVITE server
/// transaction: the next RSeq to allocate and the provisional (if any)
/// still awaiting its PRACK.
#[derive(Debug)]
pub struct ReliableProvisionalState {
    pub(crate) next_rseq: u32,
    pub(crate) unacked: Option<(u32, Response)>,
}

impl Default for ReliableProvisionalState {
    fn default() -> Self {
        // RSeq starts at 1 and increases by one per reliable provisional.
        Self {
            next_rseq: 1,
            unacked: None,
        }
    }
}

/// Shared data for a server transaction.
#[derive(Debug)]
pub struct ServerTransactionData {
    pub(crate) state: Arc<AtomicTransactionState>,
    pub(crate) key: TransactionKey,
    /// The request that created the transaction.
    pub(crate) request: Request,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events_tx: mpsc::Sender<TransactionEvent>,
    pub(crate) cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    pub(crate) timer_factory: TimerFactory,
    /// Last response sent; retransmitted when the request is re-received.
    pub(crate) last_response: Mutex<Option<Response>>,
    pub(crate) retransmit_count: AtomicU32,
    pub(crate) rel: Mutex<ReliableProvisionalState>,
}

impl ServerTransactionData {
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
            last_response: Mutex::new(None),
            retransmit_count: AtomicU32::new(0),
            rel: Mutex::new(ReliableProvisionalState::default()),
        }
    }

    pub(crate) async fn send_response_to_peer(&self, response: &Response) -> Result<()> {
        self.transport
            .send_message(Message::Response(response.clone()), self.remote_addr)
            .await
            .map_err(|e| Error::transport_error(e, "failed to send response"))
    }

    /// Retransmit the last response sent, if any.
    pub(crate) async fn retransmit_last_response(&self) -> Result<()> {
        let last = self.last_response.lock().await.clone();
        match last {
            Some(response) => self.send_response_to_peer(&response).await,
            None => Ok(()),
        }
    }

    /// Whether the stored final response (if any) is a 2xx.
    pub(crate) async fn final_is_success(&self) -> bool {
        self.last_response
            .lock()
            .await
            .as_ref()
            .map(|r| r.status.is_success())
            .unwrap_or(false)
    }

    /// Whether `rack` acknowledges the reliable provisional currently
    /// awaiting its PRACK. Used by the registry to route PRACKs.
    pub async fn matches_prack(&self, rack: &RAck) -> bool {
        let rel = self.rel.lock().await;
        match (&rel.unacked, &self.request.cseq) {
            (Some((rseq, _)), Some(cseq)) => rack.matches(*rseq, cseq),
            _ => false,
        }
    }

    pub(crate) fn reset_retransmit_count(&self) {
        self.retransmit_count.store(0, Ordering::SeqCst);
    }

    pub(crate) fn next_retransmit_iteration(&self) -> u32 {
        self.retransmit_count.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }
}

impl AsRefState for ServerTransactionData {
    fn as_ref_state(&self) -> &Arc<AtomicTransactionState> {
        &self.state
    }
}

impl AsRefKey for ServerTransactionData {
    fn as_ref_key(&self) -> &TransactionKey {
        &self.key
    }
}

impl HasTransactionEvents for ServerTransactionData {
    fn get_tu_event_sender(&self) -> mpsc::Sender<TransactionEvent> {
        self.events_tx.clone()
    }
}

impl HasTransport for ServerTransactionData {
    fn get_transport_layer(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

impl HasCommandSender for ServerTransactionData {
    fn get_self_command_sender(&self) -> mpsc::Sender<InternalTransactionCommand> {
        self.cmd_tx.clone()
    }
}

/// Active timers of a server transaction.
#[derive(Debug, Default)]
pub struct ServerTimerHandles {
    /// Timer G: non-2xx final retransmission (INVITE).
    pub retransmit: Option<JoinHandle<()>>,
    /// Timer H: ACK wait (INVITE).
    pub ack_wait: Option<JoinHandle<()>>,
    /// Timer I (INVITE Confirmed) or J (non-INVITE Completed).
    pub wait: Option<JoinHandle<()>>,
    /// Reliable-provisional retransmission (RFC 3262).
    pub rel_retransmit: Option<JoinHandle<()>>,
    /// Bound on waiting for a PRACK.
    pub rel_timeout: Option<JoinHandle<()>>,
}

impl ServerTimerHandles {
    pub fn abort_all(&mut self) {
        for handle in [
            self.retransmit.take(),
            self.ack_wait.take(),
            self.wait.take(),
            self.rel_retransmit.take(),
            self.rel_timeout.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }

    pub fn abort_rel_timers(&mut self) {
        for handle in [self.rel_retransmit.take(), self.rel_timeout.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Spawn the event loop task for a server transaction.
pub(crate) fn spawn_server_loop<L>(
    data: Arc<ServerTransactionData>,
    logic: Arc<L>,
    cmd_rx: mpsc::Receiver<InternalTransactionCommand>,
) -> JoinHandle<()>
where
    L: TransactionLogic<ServerTransactionData, ServerTimerHandles> + 'static,
{
    tokio::spawn(run_transaction_loop::<ServerTransactionData, ServerTimerHandles, L>(
        data, logic, cmd_rx,
    ))
}
