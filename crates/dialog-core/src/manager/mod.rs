//! Dialog registry and Transaction User.
//!
//! [`DialogManager`] consumes the event stream of a
//! [`TransactionManager`], maintains the dialog table, and exposes the
//! dialog-level API: creating dialogs with an INVITE, sending in-dialog
//! requests and responses, ACKing 2xx responses, and terminating
//! dialogs. It also owns the timers RFC 3261 puts on the UA core rather
//! than the transaction layer: the 2xx retransmission schedule, the
//! ACK-not-sent window, early-dialog expiry, and post-termination
//! linger.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use sipline_sip_core::{
    generate_tag, Message, Method, Request, Response, StatusCode, Via,
};
use sipline_sip_transport::Transport;
use sipline_transaction_core::{TransactionEvent, TransactionKey, TransactionManager};

use crate::config::DialogConfig;
use crate::dialog::{AckGate, Dialog, DialogId, DialogState, EarlyDialogId};
use crate::errors::{DialogError, DialogResult};
use crate::events::DialogEvent;
use crate::routing::{NextHopResolver, UriResolver};

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// A client INVITE in flight: the request (for ACK construction and fork
/// matching) and the dialogs responses to it have established so far.
#[derive(Debug)]
struct PendingInvite {
    request: Request,
    /// Dialog established by the first tagged response; later responses
    /// with the same remote tag route here.
    default_dialog: Option<DialogId>,
    /// Additional dialogs established by forked responses.
    forked: Vec<DialogId>,
    /// True for a re-INVITE inside `default_dialog`.
    is_reinvite: bool,
}

struct ManagerInner {
    config: DialogConfig,
    transactions: TransactionManager,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn NextHopResolver>,
    dialogs: Mutex<HashMap<DialogId, Dialog>>,
    /// Client INVITE transactions. Entries outlive transaction
    /// termination by the linger window so late forked 2xx still match.
    pending_invites: Mutex<HashMap<TransactionKey, PendingInvite>>,
    /// In-dialog transactions (either side) mapped to their dialog.
    tx_dialogs: Mutex<HashMap<TransactionKey, DialogId>>,
    /// UAS side: the INVITE server transaction and the 2xx sent on it,
    /// per dialog, until the peer's ACK arrives.
    uas_invites: Mutex<HashMap<DialogId, (TransactionKey, Response)>>,
    /// Cancellation handles for running 2xx retransmission schedules.
    ok_retransmits: Mutex<HashMap<DialogId, Arc<Notify>>>,
    ack_gates: Mutex<HashMap<DialogId, AckGate>>,
    events_tx: mpsc::Sender<DialogEvent>,
}

/// The dialog layer's entry point. Cheap to clone.
#[derive(Clone)]
pub struct DialogManager {
    inner: Arc<ManagerInner>,
}

impl DialogManager {
    /// Build a dialog manager on top of `transactions`, consuming the
    /// transaction event channel returned at its construction. Returns
    /// the manager and the channel carrying [`DialogEvent`]s.
    pub fn new(
        transactions: TransactionManager,
        transaction_events: mpsc::Receiver<TransactionEvent>,
        transport: Arc<dyn Transport>,
        config: DialogConfig,
    ) -> (Self, mpsc::Receiver<DialogEvent>) {
        Self::with_resolver(
            transactions,
            transaction_events,
            transport,
            Arc::new(UriResolver),
            config,
        )
    }

    /// Like [`new`](Self::new) with a custom next-hop resolver.
    pub fn with_resolver(
        transactions: TransactionManager,
        transaction_events: mpsc::Receiver<TransactionEvent>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn NextHopResolver>,
        config: DialogConfig,
    ) -> (Self, mpsc::Receiver<DialogEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(ManagerInner {
            config,
            transactions,
            transport,
            resolver,
            dialogs: Mutex::new(HashMap::new()),
            pending_invites: Mutex::new(HashMap::new()),
            tx_dialogs: Mutex::new(HashMap::new()),
            uas_invites: Mutex::new(HashMap::new()),
            ok_retransmits: Mutex::new(HashMap::new()),
            ack_gates: Mutex::new(HashMap::new()),
            events_tx,
        });
        spawn_event_loop(&inner, transaction_events);
        (Self { inner }, events_rx)
    }

    pub fn config(&self) -> &DialogConfig {
        &self.inner.config
    }

    pub async fn dialog_count(&self) -> usize {
        self.inner.dialogs.lock().await.len()
    }

    /// Snapshot of a dialog, if present.
    pub async fn dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.dialogs.lock().await.get(id).cloned()
    }

    pub async fn dialog_state(&self, id: &DialogId) -> DialogResult<DialogState> {
        self.inner
            .dialogs
            .lock()
            .await
            .get(id)
            .map(|d| d.state)
            .ok_or_else(|| DialogError::DialogNotFound { id: id.clone() })
    }

    /// Start a dialog-creating INVITE as UAC. The dialog itself is
    /// created when a tagged response arrives; until then the INVITE is
    /// tracked as pending. Returns the client transaction key.
    pub async fn send_invite(
        &self,
        mut request: Request,
        destination: SocketAddr,
    ) -> DialogResult<TransactionKey> {
        if request.method != Method::Invite {
            return Err(DialogError::invalid_state(format!(
                "dialog-creating request must be INVITE, got {}",
                request.method
            )));
        }
        if let Some(from) = request.from.as_mut() {
            from.ensure_tag();
        }
        let key = self
            .inner
            .transactions
            .create_client_transaction(request.clone(), destination)
            .await?;
        self.inner.pending_invites.lock().await.insert(
            key.clone(),
            PendingInvite {
                request,
                default_dialog: None,
                forked: Vec::new(),
                is_reinvite: false,
            },
        );
        self.inner.transactions.send_request(&key).await?;
        debug!(id = %key, "dialog-creating INVITE sent");
        Ok(key)
    }

    /// Send an in-dialog request (re-INVITE, BYE, INFO, ...). The CSeq
    /// is assigned under the dialog lock; the next hop comes from the
    /// route set via the resolver. Re-INVITEs on a back-to-back dialog
    /// wait on the ACK gate first.
    pub async fn send_request(
        &self,
        id: &DialogId,
        method: Method,
        body: Vec<u8>,
    ) -> DialogResult<TransactionKey> {
        if method == Method::Invite {
            let gate = self.inner.gate_for(id).await;
            gate.acquire().await?;
        }
        let result = self.send_request_inner(id, method.clone(), body).await;
        if result.is_err() && method == Method::Invite {
            self.inner.release_gate(id).await;
        }
        result
    }

    async fn send_request_inner(
        &self,
        id: &DialogId,
        method: Method,
        body: Vec<u8>,
    ) -> DialogResult<TransactionKey> {
        let request = {
            let mut dialogs = self.inner.dialogs.lock().await;
            let dialog = dialogs
                .get_mut(id)
                .ok_or_else(|| DialogError::DialogNotFound { id: id.clone() })?;
            let mut request = dialog.next_request(method.clone())?;
            request.body = body;
            request
        };

        let hop = self.inner.resolver.resolve(&request).await?;
        let key = self
            .inner
            .transactions
            .create_client_transaction(request.clone(), hop.address)
            .await?;
        self.inner
            .tx_dialogs
            .lock()
            .await
            .insert(key.clone(), id.clone());
        if method == Method::Invite {
            self.inner.pending_invites.lock().await.insert(
                key.clone(),
                PendingInvite {
                    request,
                    default_dialog: Some(id.clone()),
                    forked: Vec::new(),
                    is_reinvite: true,
                },
            );
        }
        self.inner.transactions.send_request(&key).await?;
        Ok(key)
    }

    /// Send the ACK this side owes for a received 2xx. Built from the
    /// recorded INVITE/2xx pair, sent outside any transaction, and
    /// releases the ACK gate on back-to-back dialogs.
    pub async fn send_ack(&self, id: &DialogId) -> DialogResult<()> {
        let ack = {
            let mut dialogs = self.inner.dialogs.lock().await;
            let dialog = dialogs
                .get_mut(id)
                .ok_or_else(|| DialogError::DialogNotFound { id: id.clone() })?;
            let via = Via::new(
                self.inner.transport.transport_kind(),
                self.inner.transport.local_addr().to_string(),
            );
            dialog.create_ack(via)?
        };
        let hop = self.inner.resolver.resolve(&ack).await?;
        self.inner
            .transport
            .send_message(Message::Request(ack), hop.address)
            .await
            .map_err(|e| DialogError::Other(format!("ACK send failed: {e}")))?;
        self.inner.release_gate(id).await;
        debug!(dialog = %id, "ACK sent");
        Ok(())
    }

    /// Respond on a server transaction belonging to a dialog. The To tag
    /// is stamped from the dialog; dialog state follows the status class
    /// (tagged 1xx confirms Early, 2xx confirms the dialog and starts
    /// the 2xx retransmission schedule, a final non-2xx on the
    /// dialog-creating INVITE terminates it, a 2xx to BYE completes the
    /// termination the peer started).
    pub async fn send_response(
        &self,
        key: &TransactionKey,
        mut response: Response,
    ) -> DialogResult<()> {
        let dialog_id = self.inner.tx_dialogs.lock().await.get(key).cloned();
        let Some(dialog_id) = dialog_id else {
            // Out-of-dialog server transaction (OPTIONS and friends).
            self.inner.transactions.send_response(key, response).await?;
            return Ok(());
        };

        let (is_invite, request_method) = (key.method == Method::Invite, key.method.clone());
        let status = response.status;

        {
            let mut dialogs = self.inner.dialogs.lock().await;
            let dialog = dialogs
                .get_mut(&dialog_id)
                .ok_or_else(|| DialogError::DialogNotFound { id: dialog_id.clone() })?;
            if response.to_tag().is_none() {
                if let Some(tag) = dialog.local_tag.clone() {
                    response = response.with_to_tag(tag);
                }
            }
            if is_invite && status.is_success() {
                dialog.expect_ack();
            }
        }

        self.inner
            .transactions
            .send_response(key, response.clone())
            .await?;

        if is_invite && status.is_provisional() && response.to_tag().is_some() {
            self.inner
                .transition_dialog(&dialog_id, DialogState::Early)
                .await;
        } else if is_invite && status.is_success() {
            self.inner
                .transition_dialog(&dialog_id, DialogState::Confirmed)
                .await;
            self.inner
                .uas_invites
                .lock()
                .await
                .insert(dialog_id.clone(), (key.clone(), response.clone()));
            spawn_ok_retransmit(&self.inner, dialog_id.clone());
        } else if is_invite && status.is_failure() {
            self.inner
                .terminate_dialog_inner(&dialog_id, "rejected")
                .await;
        } else if request_method == Method::Bye && status.is_success() {
            self.inner.terminate_dialog_inner(&dialog_id, "BYE").await;
        }
        Ok(())
    }

    /// Send a reliable provisional (RFC 3262) on a dialog's INVITE
    /// server transaction. Moves the dialog to Early.
    pub async fn send_reliable_provisional(
        &self,
        key: &TransactionKey,
        mut response: Response,
    ) -> DialogResult<()> {
        let dialog_id = self
            .inner
            .tx_dialogs
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| DialogError::invalid_state("transaction belongs to no dialog"))?;
        {
            let dialogs = self.inner.dialogs.lock().await;
            let dialog = dialogs
                .get(&dialog_id)
                .ok_or_else(|| DialogError::DialogNotFound { id: dialog_id.clone() })?;
            if response.to_tag().is_none() {
                if let Some(tag) = dialog.local_tag.clone() {
                    response = response.with_to_tag(tag);
                }
            }
        }
        self.inner
            .transactions
            .send_reliable_provisional(key, response)
            .await?;
        self.inner
            .transition_dialog(&dialog_id, DialogState::Early)
            .await;
        Ok(())
    }

    /// Cancel a pending dialog-creating INVITE (UAC side).
    pub async fn cancel_invite(&self, key: &TransactionKey) -> DialogResult<TransactionKey> {
        Ok(self.inner.transactions.cancel_invite(key).await?)
    }

    /// Tear a dialog down without signaling. Emits `Terminated` and
    /// schedules linger removal; sending a BYE first is the caller's
    /// decision.
    pub async fn terminate_dialog(&self, id: &DialogId, reason: &str) -> DialogResult<()> {
        if !self.inner.dialogs.lock().await.contains_key(id) {
            return Err(DialogError::DialogNotFound { id: id.clone() });
        }
        self.inner.terminate_dialog_inner(id, reason).await;
        Ok(())
    }
}

impl ManagerInner {
    async fn emit(&self, event: DialogEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("dialog event receiver dropped");
        }
    }

    async fn gate_for(&self, id: &DialogId) -> AckGate {
        let enforced = {
            let dialogs = self.dialogs.lock().await;
            dialogs.get(id).map(|d| d.is_b2bua).unwrap_or(false)
        };
        let mut gates = self.ack_gates.lock().await;
        gates
            .entry(id.clone())
            .or_insert_with(|| AckGate::new(enforced, self.config.ack_gate_timeout))
            .clone()
    }

    async fn release_gate(&self, id: &DialogId) {
        if let Some(gate) = self.ack_gates.lock().await.get(id) {
            gate.release();
        }
    }

    /// Move a dialog to `next`, emitting `StateChanged` when it moved.
    async fn transition_dialog(&self, id: &DialogId, next: DialogState) {
        let transition = {
            let mut dialogs = self.dialogs.lock().await;
            match dialogs.get_mut(id) {
                Some(dialog) if dialog.state != next => dialog.transition_to(next).ok(),
                _ => None,
            }
        };
        if let Some(previous) = transition {
            self.emit(DialogEvent::StateChanged {
                dialog_id: id.clone(),
                previous,
                current: next,
            })
            .await;
        }
    }

    async fn terminate_dialog_inner(self: &Arc<Self>, id: &DialogId, reason: &str) {
        let previous = {
            let mut dialogs = self.dialogs.lock().await;
            match dialogs.get_mut(id) {
                Some(dialog) if !dialog.is_terminated() => Some(dialog.terminate()),
                _ => None,
            }
        };
        let Some(previous) = previous else { return };
        self.cancel_ok_retransmit(id).await;
        self.release_gate(id).await;
        self.emit(DialogEvent::StateChanged {
            dialog_id: id.clone(),
            previous,
            current: DialogState::Terminated,
        })
        .await;
        self.emit(DialogEvent::Terminated {
            dialog_id: id.clone(),
            reason: reason.to_string(),
        })
        .await;
        spawn_linger_removal(self, id.clone());
    }

    async fn cancel_ok_retransmit(&self, id: &DialogId) {
        if let Some(notify) = self.ok_retransmits.lock().await.remove(id) {
            notify.notify_waiters();
        }
    }

    /// Register a dialog created from a response to a pending INVITE,
    /// claiming the default slot or linking a forked dialog.
    async fn register_uac_dialog(
        self: &Arc<Self>,
        key: &TransactionKey,
        dialog: Dialog,
    ) -> Option<DialogId> {
        let id = dialog.id()?;
        let (created, forked_from) = {
            let mut pending = self.pending_invites.lock().await;
            let entry = pending.get_mut(key)?;
            match &entry.default_dialog {
                None => {
                    entry.default_dialog = Some(id.clone());
                    (true, None)
                }
                Some(default) if *default == id => (false, None),
                Some(default) => {
                    if !entry.forked.contains(&id) {
                        entry.forked.push(id.clone());
                        (true, Some(default.clone()))
                    } else {
                        (false, None)
                    }
                }
            }
        };
        if created {
            let state = dialog.state;
            self.dialogs.lock().await.insert(id.clone(), dialog);
            self.emit(DialogEvent::Created {
                dialog_id: id.clone(),
            })
            .await;
            if let Some(original) = forked_from {
                self.emit(DialogEvent::ForkedDialogCreated {
                    dialog_id: id.clone(),
                    original,
                })
                .await;
            }
            if state == DialogState::Early {
                spawn_early_timeout(self, id.clone());
            }
        }
        Some(id)
    }
}

fn spawn_event_loop(
    inner: &Arc<ManagerInner>,
    mut transaction_events: mpsc::Receiver<TransactionEvent>,
) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(event) = transaction_events.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            handle_transaction_event(&inner, event).await;
        }
        debug!("dialog event loop stopped");
    });
}

async fn handle_transaction_event(inner: &Arc<ManagerInner>, event: TransactionEvent) {
    match event {
        TransactionEvent::ProvisionalResponse {
            transaction_id,
            response,
        } => {
            if transaction_id.method == Method::Invite {
                handle_invite_response(inner, &transaction_id, response).await;
            } else {
                forward_response(inner, &transaction_id, response).await;
            }
        }

        TransactionEvent::SuccessResponse {
            transaction_id,
            response,
            ..
        } => {
            if transaction_id.method == Method::Invite {
                handle_invite_response(inner, &transaction_id, response).await;
            } else {
                let dialog_id = forward_response(inner, &transaction_id, response).await;
                // 2xx to BYE completes a termination this side started.
                if transaction_id.method == Method::Bye {
                    if let Some(id) = dialog_id {
                        inner.terminate_dialog_inner(&id, "BYE").await;
                    }
                }
            }
        }

        TransactionEvent::FailureResponse {
            transaction_id,
            response,
        } => {
            if transaction_id.method == Method::Invite {
                handle_invite_failure(inner, &transaction_id, response).await;
            } else {
                let dialog_id = forward_response(inner, &transaction_id, response).await;
                // A peer that rejects our BYE gets torn down regardless.
                if transaction_id.method == Method::Bye {
                    if let Some(id) = dialog_id {
                        inner.terminate_dialog_inner(&id, "BYE").await;
                    }
                }
            }
        }

        TransactionEvent::NewRequest {
            transaction_id,
            request,
            ..
        } => {
            handle_new_request(inner, transaction_id, request).await;
        }

        TransactionEvent::CancelReceived {
            transaction_id,
            cancel_request,
        } => {
            let dialog_id = inner.tx_dialogs.lock().await.get(&transaction_id).cloned();
            if let Some(dialog_id) = dialog_id {
                inner
                    .emit(DialogEvent::CancelReceived {
                        dialog_id,
                        cancel: cancel_request,
                    })
                    .await;
            }
        }

        TransactionEvent::StrayAck { request, .. } => {
            handle_stray_ack(inner, request).await;
        }

        TransactionEvent::StrayResponse { response, .. } => {
            handle_stray_response(inner, response).await;
        }

        TransactionEvent::TransactionTimeout { transaction_id, .. } => {
            handle_transaction_failure(inner, &transaction_id, "timeout").await;
        }

        TransactionEvent::TransportError { transaction_id } => {
            handle_transaction_failure(inner, &transaction_id, "transport error").await;
        }

        TransactionEvent::TransactionTerminated { transaction_id } => {
            spawn_tx_cleanup(inner, transaction_id);
        }

        TransactionEvent::Error {
            transaction_id,
            error,
        } => {
            let dialog_id = match transaction_id {
                Some(key) => inner.tx_dialogs.lock().await.get(&key).cloned(),
                None => None,
            };
            inner.emit(DialogEvent::Error { dialog_id, error }).await;
        }

        // Transaction-internal bookkeeping, nothing dialog-level to do.
        TransactionEvent::StateChanged { .. }
        | TransactionEvent::AckReceived { .. }
        | TransactionEvent::PrackReceived { .. } => {}
    }
}

/// Route a non-INVITE response to its dialog and hand it to the
/// application. Returns the dialog id when one was found.
async fn forward_response(
    inner: &Arc<ManagerInner>,
    key: &TransactionKey,
    response: Response,
) -> Option<DialogId> {
    let dialog_id = inner.tx_dialogs.lock().await.get(key).cloned()?;
    inner
        .emit(DialogEvent::ResponseReceived {
            dialog_id: dialog_id.clone(),
            transaction_key: key.clone(),
            response,
        })
        .await;
    Some(dialog_id)
}

/// A response to a client INVITE: create, claim, or update the dialog it
/// establishes, including the forking paths.
async fn handle_invite_response(
    inner: &Arc<ManagerInner>,
    key: &TransactionKey,
    response: Response,
) {
    let Some(remote_tag) = response.to_tag().map(str::to_string) else {
        // Untagged 100 Trying establishes nothing.
        return;
    };
    let (invite, is_reinvite, default_dialog) = {
        let pending = inner.pending_invites.lock().await;
        match pending.get(key) {
            Some(p) => (
                p.request.clone(),
                p.is_reinvite,
                p.default_dialog.clone(),
            ),
            None => {
                debug!(id = %key, "INVITE response without pending INVITE, dropping");
                return;
            }
        }
    };

    if is_reinvite {
        let Some(dialog_id) = default_dialog else { return };
        if response.status.is_success() {
            let mut dialogs = inner.dialogs.lock().await;
            if let Some(dialog) = dialogs.get_mut(&dialog_id) {
                if let Some(contact) = &response.contact {
                    dialog.update_remote_target(contact);
                }
                dialog.record_invite_ok(invite, response.clone());
            }
        }
        inner
            .emit(DialogEvent::ResponseReceived {
                dialog_id,
                transaction_key: key.clone(),
                response,
            })
            .await;
        return;
    }

    // Initial INVITE. Which dialog does this remote tag belong to?
    let local_tag = invite.from_tag().unwrap_or_default().to_string();
    let call_id = invite.call_id_str().unwrap_or_default().to_string();
    let dialog_id = EarlyDialogId::new(call_id, local_tag).with_remote_tag(remote_tag);

    let exists = inner.dialogs.lock().await.contains_key(&dialog_id);
    if exists {
        if response.status.is_success() {
            let previous = {
                let mut dialogs = inner.dialogs.lock().await;
                dialogs.get_mut(&dialog_id).and_then(|dialog| {
                    let previous = dialog.update_from_2xx(&response).ok();
                    dialog.record_invite_ok(invite.clone(), response.clone());
                    previous
                })
            };
            if let Some(previous) = previous {
                if previous != DialogState::Confirmed {
                    inner
                        .emit(DialogEvent::StateChanged {
                            dialog_id: dialog_id.clone(),
                            previous,
                            current: DialogState::Confirmed,
                        })
                        .await;
                    spawn_ack_watchdog(inner, dialog_id.clone());
                }
            }
        }
    } else {
        let b2bua = inner.config.enforce_ack_gate;
        let dialog = if response.status.is_success() {
            Dialog::from_2xx_response(&invite, &response, b2bua)
        } else {
            Dialog::from_provisional_response(&invite, &response, b2bua)
        };
        let Some(mut dialog) = dialog else { return };
        dialog.set_cseq_validation(inner.config.cseq_validation);
        if response.status.is_success() {
            dialog.record_invite_ok(invite.clone(), response.clone());
        }
        let confirmed = response.status.is_success();
        if inner.register_uac_dialog(key, dialog).await.is_some() && confirmed {
            spawn_ack_watchdog(inner, dialog_id.clone());
        }
    }

    inner
        .emit(DialogEvent::ResponseReceived {
            dialog_id,
            transaction_key: key.clone(),
            response,
        })
        .await;
}

/// Final non-2xx on a client INVITE: every early dialog it established
/// dies (RFC 3261 section 12.3).
async fn handle_invite_failure(
    inner: &Arc<ManagerInner>,
    key: &TransactionKey,
    response: Response,
) {
    let (default_dialog, forked, is_reinvite) = {
        let pending = inner.pending_invites.lock().await;
        match pending.get(key) {
            Some(p) => (p.default_dialog.clone(), p.forked.clone(), p.is_reinvite),
            None => return,
        }
    };
    if is_reinvite {
        // The dialog survives a rejected re-INVITE; free the gate.
        if let Some(id) = &default_dialog {
            inner.release_gate(id).await;
            inner
                .emit(DialogEvent::ResponseReceived {
                    dialog_id: id.clone(),
                    transaction_key: key.clone(),
                    response,
                })
                .await;
        }
        return;
    }
    for id in default_dialog.iter().chain(forked.iter()) {
        inner.terminate_dialog_inner(id, "rejected").await;
    }
    if let Some(id) = default_dialog {
        inner
            .emit(DialogEvent::ResponseReceived {
                dialog_id: id,
                transaction_key: key.clone(),
                response,
            })
            .await;
    }
}

/// An inbound request that created a server transaction.
async fn handle_new_request(
    inner: &Arc<ManagerInner>,
    key: TransactionKey,
    request: Request,
) {
    match request.to_tag() {
        None => {
            if request.method == Method::Invite {
                handle_uas_invite(inner, key, request).await;
            } else {
                // Out-of-dialog non-INVITE: no dialog involvement, the
                // application answers directly.
                inner
                    .emit(DialogEvent::RequestReceived {
                        dialog_id: None,
                        transaction_key: key,
                        request,
                    })
                    .await;
            }
        }
        Some(local_tag) => {
            let dialog_id = DialogId::new(
                request.call_id_str().unwrap_or_default(),
                local_tag,
                request.from_tag().unwrap_or_default(),
            );
            handle_in_dialog_request(inner, key, dialog_id, request).await;
        }
    }
}

/// Dialog-creating INVITE as UAS: the dialog exists immediately with a
/// locally chosen tag, in Initial state, awaiting the application's
/// response.
async fn handle_uas_invite(inner: &Arc<ManagerInner>, key: TransactionKey, request: Request) {
    let Some(mut dialog) = Dialog::from_request(&request, inner.config.enforce_ack_gate) else {
        warn!(id = %key, "INVITE with incomplete dialog headers");
        return;
    };
    dialog.set_local_tag(generate_tag());
    dialog.set_cseq_validation(inner.config.cseq_validation);
    let Some(dialog_id) = dialog.id() else { return };

    inner
        .dialogs
        .lock()
        .await
        .insert(dialog_id.clone(), dialog);
    inner
        .tx_dialogs
        .lock()
        .await
        .insert(key.clone(), dialog_id.clone());
    inner
        .emit(DialogEvent::Created {
            dialog_id: dialog_id.clone(),
        })
        .await;
    spawn_early_timeout(inner, dialog_id.clone());
    inner
        .emit(DialogEvent::RequestReceived {
            dialog_id: Some(dialog_id),
            transaction_key: key,
            request,
        })
        .await;
}

/// Tagged request inside an existing dialog: CSeq gating, target
/// refresh, then up to the application.
async fn handle_in_dialog_request(
    inner: &Arc<ManagerInner>,
    key: TransactionKey,
    dialog_id: DialogId,
    request: Request,
) {
    let accepted = {
        let mut dialogs = inner.dialogs.lock().await;
        match dialogs.get_mut(&dialog_id) {
            None => None,
            Some(dialog) => {
                let seq = request.cseq_seq().unwrap_or(0);
                match dialog.update_remote_sequence(seq) {
                    Ok(()) => {
                        if request.method == Method::Invite {
                            if let Some(contact) = &request.contact {
                                dialog.update_remote_target(contact);
                            }
                            dialog.expect_ack();
                        }
                        Some(true)
                    }
                    Err(_) => Some(false),
                }
            }
        }
    };

    match accepted {
        None => {
            let reply =
                Response::for_request(StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST, &request);
            if let Err(e) = inner.transactions.send_response(&key, reply).await {
                debug!(id = %key, error = %e, "481 reply failed");
            }
        }
        Some(false) => {
            warn!(dialog = %dialog_id, "stale CSeq on in-dialog request");
            let reply = Response::for_request(StatusCode::SERVER_INTERNAL_ERROR, &request)
                .with_reason("CSeq Out Of Order");
            if let Err(e) = inner.transactions.send_response(&key, reply).await {
                debug!(id = %key, error = %e, "500 reply failed");
            }
        }
        Some(true) => {
            inner
                .tx_dialogs
                .lock()
                .await
                .insert(key.clone(), dialog_id.clone());
            inner
                .emit(DialogEvent::RequestReceived {
                    dialog_id: Some(dialog_id),
                    transaction_key: key,
                    request,
                })
                .await;
        }
    }
}

/// ACK addressed to a 2xx this side sent. It reaches the manager as a
/// stray because the ACK to a 2xx is its own transaction-less message.
async fn handle_stray_ack(inner: &Arc<ManagerInner>, request: Request) {
    let Some(local_tag) = request.to_tag() else { return };
    let dialog_id = DialogId::new(
        request.call_id_str().unwrap_or_default(),
        local_tag,
        request.from_tag().unwrap_or_default(),
    );
    let first = {
        let mut dialogs = inner.dialogs.lock().await;
        match dialogs.get_mut(&dialog_id) {
            Some(dialog) => dialog.receive_ack(),
            None => return,
        }
    };
    if !first {
        return;
    }
    inner.cancel_ok_retransmit(&dialog_id).await;
    let invite_key = inner
        .uas_invites
        .lock()
        .await
        .remove(&dialog_id)
        .map(|(key, _)| key);
    if let Some(key) = invite_key {
        // Let the INVITE server transaction finish its machine.
        if let Err(e) = inner.transactions.notify_ack_received(&key, request).await {
            debug!(id = %key, error = %e, "ACK forward to transaction failed");
        }
    }
    inner.emit(DialogEvent::AckReceived { dialog_id }).await;
}

/// Find the pending dialog-creating INVITE a forked response answers.
async fn match_unanswered_invite(
    inner: &Arc<ManagerInner>,
    response: &Response,
) -> Option<(TransactionKey, Request)> {
    let pending = inner.pending_invites.lock().await;
    pending.iter().find_map(|(key, p)| {
        (!p.is_reinvite
            && p.request.call_id_str() == response.call_id_str()
            && p.request.from_tag() == response.from_tag())
        .then(|| (key.clone(), p.request.clone()))
    })
}

/// A response with no live client transaction: either a retransmitted
/// 2xx our ACK got lost for, or a forked 2xx arriving after the INVITE
/// transaction terminated.
async fn handle_stray_response(inner: &Arc<ManagerInner>, response: Response) {
    if !response.status.is_success() || response.cseq_method() != Some(&Method::Invite) {
        return;
    }
    let Some(remote_tag) = response.to_tag() else { return };
    let dialog_id = DialogId::new(
        response.call_id_str().unwrap_or_default(),
        response.from_tag().unwrap_or_default(),
        remote_tag,
    );

    // Retransmitted 2xx for a dialog we already have: answer with the
    // same ACK again.
    let known = {
        let dialogs = inner.dialogs.lock().await;
        dialogs
            .get(&dialog_id)
            .map(|dialog| (dialog.state, dialog.last_ack_sent.clone()))
    };
    match known {
        Some((DialogState::Confirmed, Some(ack))) => {
            if let Ok(hop) = inner.resolver.resolve(&ack).await {
                if let Err(e) = inner
                    .transport
                    .send_message(Message::Request(ack), hop.address)
                    .await
                {
                    warn!(dialog = %dialog_id, error = %e, "re-ACK send failed");
                }
            }
        }
        Some((DialogState::Early, _)) => {
            // Late 2xx for a fork still ringing: its INVITE transaction
            // is gone, so the confirmation has to happen here.
            let Some((key, invite)) = match_unanswered_invite(inner, &response).await else {
                return;
            };
            let previous = {
                let mut dialogs = inner.dialogs.lock().await;
                dialogs.get_mut(&dialog_id).and_then(|dialog| {
                    let previous = dialog.update_from_2xx(&response).ok();
                    dialog.record_invite_ok(invite, response.clone());
                    previous
                })
            };
            let Some(previous) = previous else { return };
            inner
                .emit(DialogEvent::StateChanged {
                    dialog_id: dialog_id.clone(),
                    previous,
                    current: DialogState::Confirmed,
                })
                .await;
            spawn_ack_watchdog(inner, dialog_id.clone());
            inner
                .emit(DialogEvent::ResponseReceived {
                    dialog_id,
                    transaction_key: key,
                    response,
                })
                .await;
        }
        Some(_) => {
            // Confirmed without a recorded ACK, or already torn down;
            // nothing for us to retransmit.
        }
        None => {
            // Forked 2xx after the transaction went away: match it to
            // the pending INVITE it answers and create the late dialog.
            let Some((key, invite)) = match_unanswered_invite(inner, &response).await else {
                return;
            };
            let Some(mut dialog) =
                Dialog::from_2xx_response(&invite, &response, inner.config.enforce_ack_gate)
            else {
                return;
            };
            dialog.set_cseq_validation(inner.config.cseq_validation);
            dialog.record_invite_ok(invite, response.clone());
            if inner.register_uac_dialog(&key, dialog).await.is_some() {
                spawn_ack_watchdog(inner, dialog_id.clone());
                inner
                    .emit(DialogEvent::ResponseReceived {
                        dialog_id,
                        transaction_key: key,
                        response,
                    })
                    .await;
            }
        }
    }
}

/// Timeout or transport failure on a transaction: early dialogs of a
/// dialog-creating INVITE die; established dialogs die when the failed
/// transaction was their BYE or re-INVITE.
async fn handle_transaction_failure(
    inner: &Arc<ManagerInner>,
    key: &TransactionKey,
    reason: &str,
) {
    if key.method == Method::Invite && !key.is_server {
        let (default_dialog, forked, is_reinvite) = {
            let pending = inner.pending_invites.lock().await;
            match pending.get(key) {
                Some(p) => (p.default_dialog.clone(), p.forked.clone(), p.is_reinvite),
                None => (None, Vec::new(), false),
            }
        };
        if is_reinvite {
            if let Some(id) = default_dialog {
                inner.release_gate(&id).await;
                inner.terminate_dialog_inner(&id, reason).await;
            }
            return;
        }
        for id in default_dialog.iter().chain(forked.iter()) {
            inner.terminate_dialog_inner(id, reason).await;
        }
        return;
    }
    let dialog_id = inner.tx_dialogs.lock().await.get(key).cloned();
    if let Some(id) = dialog_id {
        if key.method == Method::Bye {
            inner.terminate_dialog_inner(&id, reason).await;
        } else {
            inner
                .emit(DialogEvent::Error {
                    dialog_id: Some(id),
                    error: format!("transaction {key} failed: {reason}"),
                })
                .await;
        }
    }
}

/// UAS 2xx retransmission schedule (RFC 3261 section 13.3.1.4): resend
/// the 2xx at T1 doubling up to T2 until the ACK arrives; give up at
/// 64*T1, emit `AckNotReceived`, and kill the dialog.
fn spawn_ok_retransmit(inner: &Arc<ManagerInner>, dialog_id: DialogId) {
    let weak = Arc::downgrade(inner);
    let cancel = Arc::new(Notify::new());
    let cancel_task = Arc::clone(&cancel);
    let settings = inner.config.timer_settings.clone();
    let deadline = inner.config.ack_wait();

    tokio::spawn(async move {
        {
            let Some(inner) = weak.upgrade() else { return };
            inner
                .ok_retransmits
                .lock()
                .await
                .insert(dialog_id.clone(), Arc::clone(&cancel_task));
        }
        let started = tokio::time::Instant::now();
        let mut interval = settings.t1;
        loop {
            tokio::select! {
                _ = cancel_task.notified() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            if started.elapsed() >= deadline {
                inner.ok_retransmits.lock().await.remove(&dialog_id);
                inner.uas_invites.lock().await.remove(&dialog_id);
                inner
                    .emit(DialogEvent::AckNotReceived {
                        dialog_id: dialog_id.clone(),
                    })
                    .await;
                inner.terminate_dialog_inner(&dialog_id, "ACK never received").await;
                return;
            }
            let response = {
                let uas = inner.uas_invites.lock().await;
                uas.get(&dialog_id).map(|(_, ok)| ok.clone())
            };
            let Some(response) = response else { return };
            // The 2xx retransmits to the source learned by the transaction
            // layer; with our transports the Via sent-by is that address.
            if let Some(addr) = retransmit_target(&response) {
                if let Err(e) = inner
                    .transport
                    .send_message(Message::Response(response), addr)
                    .await
                {
                    warn!(dialog = %dialog_id, error = %e, "2xx retransmit failed");
                }
            }
            interval = (interval * 2).min(settings.t2);
        }
    });
}

fn retransmit_target(response: &Response) -> Option<SocketAddr> {
    response.via.first().and_then(|via| via.sent_by.parse().ok())
}

/// UAC watchdog: if the application never sends the ACK it owes for a
/// received 2xx, emit `AckNotSent` and terminate.
fn spawn_ack_watchdog(inner: &Arc<ManagerInner>, dialog_id: DialogId) {
    let weak = Arc::downgrade(inner);
    let wait = inner.config.ack_wait();
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let Some(inner) = weak.upgrade() else { return };
        let owed = {
            let dialogs = inner.dialogs.lock().await;
            dialogs
                .get(&dialog_id)
                .map(|d| d.has_pending_ok())
                .unwrap_or(false)
        };
        if owed {
            inner
                .emit(DialogEvent::AckNotSent {
                    dialog_id: dialog_id.clone(),
                })
                .await;
            inner.terminate_dialog_inner(&dialog_id, "ACK never sent").await;
        }
    });
}

/// Early dialogs that never confirm are evicted.
fn spawn_early_timeout(inner: &Arc<ManagerInner>, dialog_id: DialogId) {
    let weak = Arc::downgrade(inner);
    let wait = inner.config.early_dialog_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let Some(inner) = weak.upgrade() else { return };
        let still_early = {
            let dialogs = inner.dialogs.lock().await;
            dialogs
                .get(&dialog_id)
                .map(|d| matches!(d.state, DialogState::Initial | DialogState::Early))
                .unwrap_or(false)
        };
        if still_early {
            inner
                .emit(DialogEvent::EarlyTimeout {
                    dialog_id: dialog_id.clone(),
                })
                .await;
            inner
                .terminate_dialog_inner(&dialog_id, "early dialog timeout")
                .await;
        }
    });
}

/// Terminated dialogs linger so late retransmissions still match them,
/// then everything keyed by the dialog is dropped.
fn spawn_linger_removal(inner: &Arc<ManagerInner>, dialog_id: DialogId) {
    let weak = Arc::downgrade(inner);
    let linger = inner.config.linger_duration;
    tokio::spawn(async move {
        tokio::time::sleep(linger).await;
        let Some(inner) = weak.upgrade() else { return };
        inner.dialogs.lock().await.remove(&dialog_id);
        inner.uas_invites.lock().await.remove(&dialog_id);
        inner.ok_retransmits.lock().await.remove(&dialog_id);
        inner.ack_gates.lock().await.remove(&dialog_id);
        debug!(dialog = %dialog_id, "dialog removed after linger");
    });
}

/// Transaction bookkeeping is released one linger window after the
/// transaction terminates; pending INVITEs stay that long so late forked
/// 2xx responses still find their original request.
fn spawn_tx_cleanup(inner: &Arc<ManagerInner>, key: TransactionKey) {
    let weak = Arc::downgrade(inner);
    let linger = inner.config.linger_duration;
    tokio::spawn(async move {
        tokio::time::sleep(linger).await;
        let Some(inner) = weak.upgrade() else { return };
        inner.tx_dialogs.lock().await.remove(&key);
        inner.pending_invites.lock().await.remove(&key);
    });
}
