//! Non-INVITE server transaction (RFC 3261 section 17.2.2).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use sipline_sip_core::{Message, Response};

use crate::error::Result;
use crate::server::{ServerTimerHandles, ServerTransactionData};
use crate::timer::TimerType;
use crate::transaction::logic::TransactionLogic;
use crate::transaction::{InternalTransactionCommand, TransactionKind, TransactionState};

/// State machine for the non-INVITE server transaction.
///
/// Trying: request received, nothing sent. A TU provisional moves to
/// Proceeding; a TU final moves to Completed, where Timer J absorbs
/// request retransmissions (zero on reliable transports). Request
/// retransmissions are answered with the last response sent, if any.
#[derive(Debug, Default)]
pub struct NonInviteServerLogic;

impl NonInviteServerLogic {
    async fn process_tu_response(
        &self,
        data: &Arc<ServerTransactionData>,
        response: Response,
        current_state: TransactionState,
    ) -> Result<Option<TransactionState>> {
        if matches!(
            current_state,
            TransactionState::Completed | TransactionState::Terminated
        ) {
            warn!(id = %data.key, status = %response.status, state = ?current_state,
                "TU response after final, dropped");
            return Ok(None);
        }

        *data.last_response.lock().await = Some(response.clone());
        data.send_response_to_peer(&response).await?;

        if response.status.is_provisional() {
            if current_state == TransactionState::Trying {
                return Ok(Some(TransactionState::Proceeding));
            }
            return Ok(None);
        }
        Ok(Some(TransactionState::Completed))
    }
}

#[async_trait]
impl TransactionLogic<ServerTransactionData, ServerTimerHandles> for NonInviteServerLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteServer
    }

    fn cancel_all_specific_timers(&self, timer_handles: &mut ServerTimerHandles) {
        timer_handles.abort_all();
    }

    async fn on_enter_state(
        &self,
        data: &Arc<ServerTransactionData>,
        new_state: TransactionState,
        _previous_state: TransactionState,
        timer_handles: &mut ServerTimerHandles,
        self_sender: mpsc::Sender<InternalTransactionCommand>,
    ) -> Result<()> {
        match new_state {
            TransactionState::Trying | TransactionState::Proceeding => {}
            TransactionState::Completed => {
                if data.is_reliable() {
                    // Timer J is zero on reliable transports.
                    let _ = self_sender
                        .send(InternalTransactionCommand::TransitionTo(
                            TransactionState::Terminated,
                        ))
                        .await;
                } else {
                    timer_handles.wait = Some(
                        data.timer_factory
                            .start_standard_timer(data.key.clone(), TimerType::J),
                    );
                }
            }
            TransactionState::Terminated => {}
            other => {
                warn!(id = %data.key, state = ?other, "unexpected state for non-INVITE server");
            }
        }
        Ok(())
    }

    async fn process_message(
        &self,
        data: &Arc<ServerTransactionData>,
        message: Message,
        current_state: TransactionState,
        _timer_handles: &mut ServerTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match message {
            Message::Request(request) => {
                // Retransmission of the original request.
                match current_state {
                    TransactionState::Trying => {
                        trace!(id = %data.key, method = %request.method,
                            "request retransmission before any response, absorbed");
                    }
                    TransactionState::Proceeding | TransactionState::Completed => {
                        trace!(id = %data.key, method = %request.method,
                            "request retransmission, resending last response");
                        data.retransmit_last_response().await?;
                    }
                    other => {
                        trace!(id = %data.key, state = ?other, "request ignored in this state");
                    }
                }
                Ok(None)
            }
            Message::Response(response) => {
                self.process_tu_response(data, response, current_state).await
            }
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<ServerTransactionData>,
        timer_name: &str,
        current_state: TransactionState,
        _timer_handles: &mut ServerTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (timer_name, current_state) {
            ("J", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
            (name, state) => {
                trace!(id = %data.key, timer = name, state = ?state, "stale timer ignored");
                Ok(None)
            }
        }
    }
}
