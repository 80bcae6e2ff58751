//! Stack-level transaction registry.
//!
//! The [`TransactionManager`] is the single ingress and egress point of
//! the transaction layer. Inbound messages pass validation, then table
//! lookup: a match is forwarded to the owning transaction's task, a
//! non-match either creates a server transaction, trips merge detection,
//! or is surfaced to the TU as a stray. Outbound work (new client
//! transactions, TU responses, CANCELs) goes through explicit methods
//! keyed by [`TransactionKey`].
//!
//! Tables are plain maps behind async mutexes; every mutation is a keyed
//! insert/remove. Terminated transactions linger in the table for a grace
//! window so late retransmissions still match instead of spawning
//! duplicates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, trace, warn};

use sipline_sip_core::{Message, Method, Request, Response, StatusCode};
use sipline_sip_transport::Transport;

use crate::client::{
    spawn_client_loop, ClientTransactionData, InviteClientLogic, NonInviteClientLogic,
};
use crate::error::{Error, Result};
use crate::gate::DeliveryGate;
use crate::server::{
    spawn_server_loop, InviteServerLogic, NonInviteServerLogic, ServerTransactionData,
};
use crate::timer::{TimerFactory, TimerManager, TimerSettings};
use crate::transaction::validators::validate_message;
use crate::transaction::{
    InternalTransactionCommand, MergeId, TransactionEvent, TransactionKey, TransactionState,
};
use crate::utils::{create_cancel_from_invite, generate_branch};

/// Tunables for the registry.
#[derive(Debug, Clone)]
pub struct TransactionManagerConfig {
    pub timer_settings: TimerSettings,
    /// Messages with bodies above this are answered 413 and dropped.
    pub max_body_size: usize,
    /// Above this many live transactions, new creations are refused.
    pub high_watermark: usize,
    /// Capacity waiters are released when the count drops below this.
    pub low_watermark: usize,
    /// How long a terminated transaction stays matchable in the table.
    pub linger: Duration,
    /// Bound on a single event delivery to the TU.
    pub delivery_timeout: Duration,
    pub event_channel_capacity: usize,
    pub command_channel_capacity: usize,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            timer_settings: TimerSettings::default(),
            max_body_size: 65_536,
            high_watermark: 5_000,
            low_watermark: 4_000,
            linger: Duration::from_secs(32),
            delivery_timeout: Duration::from_secs(1),
            event_channel_capacity: 128,
            command_channel_capacity: 32,
        }
    }
}

impl TransactionManagerConfig {
    /// Scaled-down config for tests: fast timers, short linger, small
    /// watermarks so overload paths are reachable.
    pub fn fast_for_tests() -> Self {
        Self {
            timer_settings: TimerSettings::fast_for_tests(),
            linger: Duration::from_millis(50),
            delivery_timeout: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

/// A live transaction as the registry sees it.
#[derive(Debug, Clone)]
enum TransactionHandle {
    Client(Arc<ClientTransactionData>),
    Server(Arc<ServerTransactionData>),
}

impl TransactionHandle {
    fn cmd_tx(&self) -> mpsc::Sender<InternalTransactionCommand> {
        match self {
            TransactionHandle::Client(data) => data.cmd_tx.clone(),
            TransactionHandle::Server(data) => data.cmd_tx.clone(),
        }
    }

    fn state(&self) -> TransactionState {
        match self {
            TransactionHandle::Client(data) => data.state.get(),
            TransactionHandle::Server(data) => data.state.get(),
        }
    }
}

struct ManagerInner {
    config: TransactionManagerConfig,
    transport: Arc<dyn Transport>,
    timer_manager: Arc<TimerManager>,
    timer_factory: TimerFactory,
    transactions: Mutex<HashMap<TransactionKey, TransactionHandle>>,
    /// Merge-detection keys of ongoing untagged server transactions.
    merge_table: Mutex<HashMap<MergeId, TransactionKey>>,
    /// Internal funnel; the pump forwards to the TU through the gate.
    events_tx: mpsc::Sender<TransactionEvent>,
    capacity_notify: Notify,
}

/// The transaction layer's registry and public API.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl TransactionManager {
    /// Create a manager over `transport`. Returns the manager and the
    /// channel on which the TU receives [`TransactionEvent`]s.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: TransactionManagerConfig,
    ) -> (Self, mpsc::Receiver<TransactionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);
        let (tu_tx, tu_rx) = mpsc::channel(config.event_channel_capacity);

        let timer_manager = Arc::new(TimerManager::new());
        let timer_factory =
            TimerFactory::new(config.timer_settings.clone(), Arc::clone(&timer_manager));
        let gate = DeliveryGate::new(config.delivery_timeout);

        let inner = Arc::new(ManagerInner {
            config,
            transport,
            timer_manager,
            timer_factory,
            transactions: Mutex::new(HashMap::new()),
            merge_table: Mutex::new(HashMap::new()),
            events_tx,
            capacity_notify: Notify::new(),
        });

        spawn_event_pump(&inner, events_rx, tu_tx, gate);

        (Self { inner }, tu_rx)
    }

    pub fn config(&self) -> &TransactionManagerConfig {
        &self.inner.config
    }

    pub async fn transaction_count(&self) -> usize {
        self.inner.transactions.lock().await.len()
    }

    /// Block until the transaction count is below the low watermark.
    /// Backpressure hook for callers creating transactions in bulk.
    pub async fn wait_for_capacity(&self) {
        loop {
            {
                let count = self.inner.transactions.lock().await.len();
                if count < self.inner.config.low_watermark {
                    return;
                }
            }
            self.inner.capacity_notify.notified().await;
        }
    }

    /// Create a client transaction for `request` aimed at `destination`.
    ///
    /// A top Via with a fresh branch is inserted when the request does not
    /// already carry one. The request is not sent until
    /// [`send_request`](Self::send_request).
    pub async fn create_client_transaction(
        &self,
        mut request: Request,
        destination: SocketAddr,
    ) -> Result<TransactionKey> {
        if request.branch().is_none() {
            let via = sipline_sip_core::Via::new(
                self.inner.transport.transport_kind(),
                self.inner.transport.local_addr().to_string(),
            )
            .with_branch(generate_branch());
            request = request.with_via(via);
        }
        let branch = request.branch().map(str::to_string).ok_or(Error::NoTransactionId)?;
        let key = TransactionKey::new(branch, request.method.clone(), false);

        let mut transactions = self.inner.transactions.lock().await;
        if transactions.len() >= self.inner.config.high_watermark {
            warn!(id = %key, count = transactions.len(), "refusing client transaction, overloaded");
            return Err(Error::Overloaded);
        }
        if transactions.contains_key(&key) {
            return Err(Error::TransactionExists { key });
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(self.inner.config.command_channel_capacity);
        let is_invite = request.method == Method::Invite;
        let data = Arc::new(ClientTransactionData::new(
            key.clone(),
            request,
            destination,
            Arc::clone(&self.inner.transport),
            self.inner.events_tx.clone(),
            cmd_tx.clone(),
            self.inner.timer_factory.clone(),
        ));
        self.inner
            .timer_manager
            .register_transaction(key.clone(), cmd_tx)
            .await;
        if is_invite {
            spawn_client_loop(Arc::clone(&data), Arc::new(InviteClientLogic), cmd_rx);
        } else {
            spawn_client_loop(Arc::clone(&data), Arc::new(NonInviteClientLogic), cmd_rx);
        }
        transactions.insert(key.clone(), TransactionHandle::Client(data));
        debug!(id = %key, "client transaction created");
        Ok(key)
    }

    /// Start a previously created client transaction: transmit the request
    /// and arm its timers.
    pub async fn send_request(&self, key: &TransactionKey) -> Result<()> {
        let handle = self.lookup(key).await?;
        let initial = if key.method == Method::Invite {
            TransactionState::Calling
        } else {
            TransactionState::Trying
        };
        handle
            .cmd_tx()
            .send(InternalTransactionCommand::TransitionTo(initial))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Hand a TU response to a server transaction for transmission.
    pub async fn send_response(&self, key: &TransactionKey, response: Response) -> Result<()> {
        let handle = self.lookup(key).await?;
        match handle {
            TransactionHandle::Server(_) => handle
                .cmd_tx()
                .send(InternalTransactionCommand::ProcessMessage(Message::Response(
                    response,
                )))
                .await
                .map_err(|_| Error::ChannelClosed),
            TransactionHandle::Client(_) => Err(Error::Other(format!(
                "{} is a client transaction, cannot send a response through it",
                key
            ))),
        }
    }

    /// Send a provisional reliably (RFC 3262): the engine allocates the
    /// RSeq and retransmits until the matching PRACK arrives.
    pub async fn send_reliable_provisional(
        &self,
        key: &TransactionKey,
        mut response: Response,
    ) -> Result<()> {
        // Marker; the transaction task assigns the real sequence number.
        response.rseq = Some(0);
        self.send_response(key, response).await
    }

    /// CANCEL a pending INVITE client transaction (RFC 3261 section 9.1).
    ///
    /// Only legal once a provisional has arrived; the CANCEL forms its own
    /// non-INVITE client transaction sharing the INVITE's branch.
    pub async fn cancel_invite(&self, invite_key: &TransactionKey) -> Result<TransactionKey> {
        let handle = self.lookup(invite_key).await?;
        let invite_data = match &handle {
            TransactionHandle::Client(data) if invite_key.method == Method::Invite => data.clone(),
            _ => {
                return Err(Error::Other(format!(
                    "{} is not an INVITE client transaction",
                    invite_key
                )))
            }
        };
        if handle.state() != TransactionState::Proceeding {
            return Err(Error::Other(
                "CANCEL requires a provisional response first".to_string(),
            ));
        }

        let cancel = create_cancel_from_invite(&invite_data.request);
        let destination = invite_data.remote_addr;
        let cancel_key = self.create_client_transaction(cancel, destination).await?;
        self.send_request(&cancel_key).await?;
        Ok(cancel_key)
    }

    /// Forward an ACK the dialog layer correlated to a 2xx back to the
    /// INVITE server transaction so it can leave Completed.
    pub async fn notify_ack_received(&self, key: &TransactionKey, ack: Request) -> Result<()> {
        let handle = self.lookup(key).await?;
        handle
            .cmd_tx()
            .send(InternalTransactionCommand::ProcessMessage(Message::Request(ack)))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Force a transaction to Terminated.
    pub async fn terminate_transaction(&self, key: &TransactionKey) -> Result<()> {
        let handle = self.lookup(key).await?;
        handle
            .cmd_tx()
            .send(InternalTransactionCommand::Terminate)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    pub async fn transaction_state(&self, key: &TransactionKey) -> Result<TransactionState> {
        Ok(self.lookup(key).await?.state())
    }

    /// Terminate every live transaction. Used at stack shutdown; the
    /// tasks emit their `TransactionTerminated` events as they wind down.
    pub async fn shutdown(&self) {
        let senders: Vec<_> = {
            let transactions = self.inner.transactions.lock().await;
            transactions.values().map(|h| h.cmd_tx()).collect()
        };
        futures::future::join_all(
            senders
                .iter()
                .map(|tx| tx.send(InternalTransactionCommand::Terminate)),
        )
        .await;
    }

    /// Sole ingress for parsed messages from the transport collaborator.
    pub async fn handle_message(&self, message: Message, source: SocketAddr) -> Result<()> {
        if let Err(reason) = validate_message(&message, self.inner.config.max_body_size) {
            if let Message::Request(request) = &message {
                self.best_effort_reply(request, reason.status_code(), source)
                    .await;
            }
            debug!(%reason, "inbound message rejected");
            return Err(Error::MessageRejected { reason });
        }

        match message {
            Message::Response(response) => self.handle_response(response, source).await,
            Message::Request(request) => self.handle_request(request, source).await,
        }
    }

    async fn handle_response(&self, response: Response, source: SocketAddr) -> Result<()> {
        let key = match TransactionKey::from_response(&response) {
            Some(k) => k,
            None => {
                trace!("response without branch, dropped");
                return Err(Error::NoTransactionId);
            }
        };

        let handle = self.inner.transactions.lock().await.get(&key).cloned();
        match handle {
            Some(h) => h
                .cmd_tx()
                .send(InternalTransactionCommand::ProcessMessage(Message::Response(
                    response,
                )))
                .await
                .map_err(|_| Error::ChannelClosed),
            None => {
                // Late forked or retransmitted 2xx; the dialog layer decides.
                trace!(id = %key, "stray response surfaced to TU");
                self.emit(TransactionEvent::StrayResponse { response, source })
                    .await
            }
        }
    }

    async fn handle_request(&self, request: Request, source: SocketAddr) -> Result<()> {
        let key = TransactionKey::from_request(&request).ok_or(Error::NoTransactionId)?;

        // Existing-transaction fast path: retransmissions, ACK to a
        // non-2xx final, and CANCEL/PRACK retransmissions all land here.
        let existing = self.inner.transactions.lock().await.get(&key).cloned();
        if let Some(handle) = existing {
            return handle
                .cmd_tx()
                .send(InternalTransactionCommand::ProcessMessage(Message::Request(
                    request,
                )))
                .await
                .map_err(|_| Error::ChannelClosed);
        }

        match request.method {
            Method::Ack => {
                // ACK to a 2xx: different branch, no transaction. TU owns it.
                trace!("ACK matched no transaction, surfaced to TU");
                self.emit(TransactionEvent::StrayAck { request, source }).await
            }
            Method::Cancel => self.handle_new_cancel(key, request, source).await,
            Method::Prack => self.handle_new_prack(key, request, source).await,
            _ => self.handle_new_request(key, request, source).await,
        }
    }

    /// A CANCEL with no transaction of its own: answer it through a fresh
    /// server transaction and, when the targeted INVITE is live, tell the
    /// TU so it can 487 the INVITE.
    async fn handle_new_cancel(
        &self,
        key: TransactionKey,
        request: Request,
        source: SocketAddr,
    ) -> Result<()> {
        let invite_key = key.with_method(Method::Invite);
        let invite_live = self.inner.transactions.lock().await.contains_key(&invite_key);

        // The TU hears about the cancellation before the CANCEL's own
        // transaction surfaces, so it can 487 the INVITE right away.
        if invite_live {
            self.emit(TransactionEvent::CancelReceived {
                transaction_id: invite_key,
                cancel_request: request.clone(),
            })
            .await?;
        }

        self.handle_new_request(key, request, source).await
    }

    /// A PRACK forms its own server transaction, and is additionally
    /// routed to the INVITE server transaction whose reliable provisional
    /// it acknowledges (matched by RSeq/CSeq, RFC 3262).
    async fn handle_new_prack(
        &self,
        key: TransactionKey,
        request: Request,
        source: SocketAddr,
    ) -> Result<()> {
        let target = match &request.rack {
            Some(rack) => {
                let transactions = self.inner.transactions.lock().await;
                let mut found = None;
                // Slow scan; PRACK carries no pointer to the INVITE's branch.
                for handle in transactions.values() {
                    if let TransactionHandle::Server(data) = handle {
                        if data.key.method == Method::Invite
                            && data.request.call_id_str() == request.call_id_str()
                            && data.matches_prack(rack).await
                        {
                            found = Some(data.clone());
                            break;
                        }
                    }
                }
                found
            }
            None => None,
        };

        self.handle_new_request(key, request.clone(), source).await?;

        if let Some(invite_data) = target {
            invite_data
                .cmd_tx
                .send(InternalTransactionCommand::ProcessMessage(Message::Request(
                    request,
                )))
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }
        Ok(())
    }

    /// Create a server transaction for a request that matched nothing.
    async fn handle_new_request(
        &self,
        key: TransactionKey,
        request: Request,
        source: SocketAddr,
    ) -> Result<()> {
        let merge_id = MergeId::from_request(&request);

        let mut transactions = self.inner.transactions.lock().await;

        // Merge detection: same untagged request via a second path.
        if let Some(id) = &merge_id {
            let merge_table = self.inner.merge_table.lock().await;
            if let Some(owner) = merge_table.get(id) {
                if *owner != key {
                    let owner = owner.clone();
                    drop(merge_table);
                    drop(transactions);
                    warn!(id = %key, owner = %owner, "merged request detected");
                    self.best_effort_reply(&request, StatusCode::LOOP_DETECTED, source)
                        .await;
                    return Err(Error::LoopDetected { key });
                }
            }
        }

        if transactions.len() >= self.inner.config.high_watermark {
            drop(transactions);
            warn!(id = %key, "refusing server transaction, overloaded");
            self.best_effort_reply(&request, StatusCode::SERVICE_UNAVAILABLE, source)
                .await;
            return Err(Error::Overloaded);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(self.inner.config.command_channel_capacity);
        let is_invite = request.method == Method::Invite;
        let data = Arc::new(ServerTransactionData::new(
            key.clone(),
            request.clone(),
            source,
            Arc::clone(&self.inner.transport),
            self.inner.events_tx.clone(),
            cmd_tx.clone(),
            self.inner.timer_factory.clone(),
        ));
        self.inner
            .timer_manager
            .register_transaction(key.clone(), cmd_tx.clone())
            .await;
        if is_invite {
            spawn_server_loop(Arc::clone(&data), Arc::new(InviteServerLogic), cmd_rx);
        } else {
            spawn_server_loop(Arc::clone(&data), Arc::new(NonInviteServerLogic), cmd_rx);
        }
        transactions.insert(key.clone(), TransactionHandle::Server(data));
        drop(transactions);

        if let Some(id) = merge_id {
            self.inner.merge_table.lock().await.insert(id, key.clone());
        }

        let initial = if is_invite {
            TransactionState::Proceeding
        } else {
            TransactionState::Trying
        };
        cmd_tx
            .send(InternalTransactionCommand::TransitionTo(initial))
            .await
            .map_err(|_| Error::ChannelClosed)?;

        debug!(id = %key, method = %request.method, "server transaction created");
        self.emit(TransactionEvent::NewRequest {
            transaction_id: key,
            request,
            source,
        })
        .await
    }

    async fn lookup(&self, key: &TransactionKey) -> Result<TransactionHandle> {
        self.inner
            .transactions
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::TransactionNotFound { key: key.clone() })
    }

    async fn emit(&self, event: TransactionEvent) -> Result<()> {
        self.inner
            .events_tx
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Answer a request with a bare status code, ignoring failures. ACKs
    /// are never answered.
    async fn best_effort_reply(&self, request: &Request, status: StatusCode, source: SocketAddr) {
        if request.method == Method::Ack {
            return;
        }
        let response = Response::for_request(status, request);
        if let Err(e) = self
            .inner
            .transport
            .send_message(Message::Response(response), source)
            .await
        {
            debug!(error = %e, status = %status, "best-effort reply failed");
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager").finish_non_exhaustive()
    }
}

/// Forward internal events to the TU through the delivery gate and reap
/// terminated transactions after the linger window.
fn spawn_event_pump(
    inner: &Arc<ManagerInner>,
    mut events_rx: mpsc::Receiver<TransactionEvent>,
    tu_tx: mpsc::Sender<TransactionEvent>,
    gate: DeliveryGate,
) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            // A CANCEL that times out takes its early INVITE down with
            // it (RFC 3261 section 9.1: the client gives up on both).
            if let TransactionEvent::TransactionTimeout { transaction_id, .. } = &event {
                if transaction_id.method == Method::Cancel && !transaction_id.is_server {
                    if let Some(inner) = weak.upgrade() {
                        reap_cancelled_invite(&inner, transaction_id).await;
                    }
                }
            }

            if let TransactionEvent::TransactionTerminated { transaction_id } = &event {
                let key = transaction_id.clone();
                let weak = weak.clone();
                tokio::spawn(async move {
                    let linger = match weak.upgrade() {
                        Some(inner) => inner.config.linger,
                        None => return,
                    };
                    tokio::time::sleep(linger).await;
                    if let Some(inner) = weak.upgrade() {
                        remove_transaction(&inner, &key).await;
                    }
                });
            }

            match gate.deliver(&tu_tx, event).await {
                Ok(()) => {}
                Err(Error::ChannelClosed) => {
                    debug!("TU event channel closed, event pump stopping");
                    break;
                }
                Err(e) => {
                    // Timed-out delivery drops the event but keeps pumping.
                    error!(error = %e, "event delivery failed");
                }
            }
        }
    });
}

/// Force-terminate the INVITE client transaction a timed-out CANCEL was
/// aimed at, when no final response ever moved it past its early states.
async fn reap_cancelled_invite(inner: &Arc<ManagerInner>, cancel_key: &TransactionKey) {
    let invite_key = cancel_key.with_method(Method::Invite);
    let handle = inner.transactions.lock().await.get(&invite_key).cloned();
    let Some(handle) = handle else { return };
    if !matches!(
        handle.state(),
        TransactionState::Calling | TransactionState::Proceeding
    ) {
        return;
    }
    warn!(id = %invite_key, "CANCEL timed out, terminating its INVITE");
    if handle
        .cmd_tx()
        .send(InternalTransactionCommand::Terminate)
        .await
        .is_err()
    {
        debug!(id = %invite_key, "INVITE already winding down");
    }
}

async fn remove_transaction(inner: &Arc<ManagerInner>, key: &TransactionKey) {
    let removed = inner.transactions.lock().await.remove(key).is_some();
    if !removed {
        return;
    }
    inner.timer_manager.unregister_transaction(key).await;
    inner
        .merge_table
        .lock()
        .await
        .retain(|_, owner| owner != key);
    trace!(id = %key, "transaction reaped after linger");

    let count = inner.transactions.lock().await.len();
    if count < inner.config.low_watermark {
        inner.capacity_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipline_sip_core::{Address, Via};
    use sipline_sip_transport::MockTransport;

    fn invite(branch: &str) -> Request {
        Request::new(Method::Invite, "sip:bob@example.net".parse().unwrap())
            .with_via(Via::new("UDP", "client.example.com:5060").with_branch(branch))
            .with_from(Address::new("sip:alice@example.com".parse().unwrap()).with_tag("ft"))
            .with_to(Address::new("sip:bob@example.net".parse().unwrap()))
            .with_call_id("call-mgr")
            .with_cseq(1)
    }

    fn source() -> SocketAddr {
        "192.0.2.1:5060".parse().unwrap()
    }

    #[tokio::test]
    async fn duplicate_request_matches_pending_transaction() {
        let transport = MockTransport::udp();
        let (manager, mut events) =
            TransactionManager::new(transport.clone(), TransactionManagerConfig::fast_for_tests());

        manager
            .handle_message(invite("z9hG4bKdup").into(), source())
            .await
            .unwrap();
        manager
            .handle_message(invite("z9hG4bKdup").into(), source())
            .await
            .unwrap();

        // Exactly one transaction and one NewRequest event.
        assert_eq!(manager.transaction_count().await, 1);
        let mut new_requests = 0;
        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            if let Some(TransactionEvent::NewRequest { .. }) = event {
                new_requests += 1;
            }
        }
        assert_eq!(new_requests, 1);
    }

    #[tokio::test]
    async fn merged_request_answered_482() {
        let transport = MockTransport::udp();
        let (manager, _events) =
            TransactionManager::new(transport.clone(), TransactionManagerConfig::fast_for_tests());

        manager
            .handle_message(invite("z9hG4bKpath1").into(), source())
            .await
            .unwrap();
        // Same From tag/Call-ID/CSeq, different branch: a merged request.
        let err = manager
            .handle_message(invite("z9hG4bKpath2").into(), source())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LoopDetected { .. }));

        let sent = transport.sent_messages().await;
        let replied_482 = sent.iter().any(|(m, _)| {
            m.as_response()
                .map(|r| r.status == StatusCode::LOOP_DETECTED)
                .unwrap_or(false)
        });
        assert!(replied_482, "expected a 482 reply, got {:?}", sent);
    }

    #[tokio::test]
    async fn overload_refuses_client_transactions() {
        let transport = MockTransport::udp();
        let mut config = TransactionManagerConfig::fast_for_tests();
        config.high_watermark = 1;
        config.low_watermark = 1;
        let (manager, _events) = TransactionManager::new(transport, config);

        let first = invite("z9hG4bKcap1");
        manager
            .create_client_transaction(first, source())
            .await
            .unwrap();

        let second = invite("z9hG4bKcap2");
        let err = manager
            .create_client_transaction(second, source())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded));
    }

    #[tokio::test]
    async fn malformed_request_answered_400() {
        let transport = MockTransport::udp();
        let (manager, _events) =
            TransactionManager::new(transport.clone(), TransactionManagerConfig::fast_for_tests());

        let mut bad = invite("z9hG4bKbad");
        bad.cseq = None;
        let err = manager.handle_message(bad.into(), source()).await.unwrap_err();
        assert!(matches!(err, Error::MessageRejected { .. }));

        let sent = transport.sent_messages().await;
        assert!(sent.iter().any(|(m, _)| {
            m.as_response()
                .map(|r| r.status == StatusCode::BAD_REQUEST)
                .unwrap_or(false)
        }));
    }
}
