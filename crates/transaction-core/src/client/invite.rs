//! INVITE client transaction (RFC 3261 section 17.1.1).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use sipline_sip_core::Message;

use crate::client::{ClientTimerHandles, ClientTransactionData};
use crate::error::{Error, Result};
use crate::timer::{calculate_backoff_interval, TimerType};
use crate::transaction::logic::TransactionLogic;
use crate::transaction::{
    InternalTransactionCommand, TransactionEvent, TransactionKind, TransactionState,
};
use crate::utils::create_ack_from_invite;

/// State machine for the INVITE client transaction.
///
/// Calling: INVITE sent, Timer A retransmits on unreliable transports
/// (doubling without cap), Timer B bounds the whole attempt. A 1xx moves
/// to Proceeding; a 2xx terminates immediately (the dialog layer owns the
/// ACK); a 3xx-6xx is ACKed here and moves to Completed, where Timer D
/// absorbs retransmitted finals.
#[derive(Debug, Default)]
pub struct InviteClientLogic;

impl InviteClientLogic {
    async fn send_ack_for(
        &self,
        data: &Arc<ClientTransactionData>,
        response: &sipline_sip_core::Response,
    ) -> Result<()> {
        let ack = create_ack_from_invite(&data.request, response);
        data.transport
            .send_message(Message::Request(ack), data.remote_addr)
            .await
            .map_err(|e| Error::transport_error(e, "failed to send ACK"))
    }
}

#[async_trait]
impl TransactionLogic<ClientTransactionData, ClientTimerHandles> for InviteClientLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteClient
    }

    fn cancel_all_specific_timers(&self, timer_handles: &mut ClientTimerHandles) {
        timer_handles.abort_all();
    }

    async fn on_enter_state(
        &self,
        data: &Arc<ClientTransactionData>,
        new_state: TransactionState,
        _previous_state: TransactionState,
        timer_handles: &mut ClientTimerHandles,
        self_sender: mpsc::Sender<InternalTransactionCommand>,
    ) -> Result<()> {
        match new_state {
            TransactionState::Calling => {
                data.send_request_to_peer().await?;
                data.reset_retransmit_count();
                if !data.is_reliable() {
                    let interval = data.timer_factory.settings().t1;
                    timer_handles.retransmit = Some(data.timer_factory.start_timer(
                        data.key.clone(),
                        TimerType::A,
                        interval,
                    ));
                }
                timer_handles.timeout = Some(
                    data.timer_factory
                        .start_standard_timer(data.key.clone(), TimerType::B),
                );
            }
            TransactionState::Proceeding => {
                // Timer A stops (cancelled by the transition); B keeps running.
                timer_handles.timeout = Some(
                    data.timer_factory
                        .start_standard_timer(data.key.clone(), TimerType::B),
                );
            }
            TransactionState::Completed => {
                if data.is_reliable() {
                    // Timer D is zero on reliable transports.
                    let _ = self_sender
                        .send(InternalTransactionCommand::TransitionTo(
                            TransactionState::Terminated,
                        ))
                        .await;
                } else {
                    timer_handles.wait = Some(
                        data.timer_factory
                            .start_standard_timer(data.key.clone(), TimerType::D),
                    );
                }
            }
            TransactionState::Terminated => {}
            other => {
                warn!(id = %data.key, state = ?other, "unexpected state for INVITE client");
            }
        }
        Ok(())
    }

    async fn process_message(
        &self,
        data: &Arc<ClientTransactionData>,
        message: Message,
        current_state: TransactionState,
        _timer_handles: &mut ClientTimerHandles,
    ) -> Result<Option<TransactionState>> {
        let response = match message {
            Message::Response(r) => r,
            Message::Request(r) => {
                warn!(id = %data.key, method = %r.method, "client transaction got a request");
                return Ok(None);
            }
        };

        match current_state {
            TransactionState::Calling | TransactionState::Proceeding => {
                if response.status.is_provisional() {
                    data.events_tx
                        .send(TransactionEvent::ProvisionalResponse {
                            transaction_id: data.key.clone(),
                            response,
                        })
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                    if current_state == TransactionState::Calling {
                        return Ok(Some(TransactionState::Proceeding));
                    }
                    return Ok(None);
                }

                if response.status.is_success() {
                    // The TU ACKs 2xx responses; the transaction is done.
                    data.events_tx
                        .send(TransactionEvent::SuccessResponse {
                            transaction_id: data.key.clone(),
                            response,
                            remote_addr: data.remote_addr,
                        })
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                    return Ok(Some(TransactionState::Terminated));
                }

                // 3xx-6xx: ACK immediately and report the failure.
                self.send_ack_for(data, &response).await?;
                *data.last_response.lock().await = Some(response.clone());
                data.events_tx
                    .send(TransactionEvent::FailureResponse {
                        transaction_id: data.key.clone(),
                        response,
                    })
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
                Ok(Some(TransactionState::Completed))
            }
            TransactionState::Completed => {
                // Retransmitted final: re-ACK, no new event, no transition.
                if response.status.is_final() {
                    trace!(id = %data.key, status = %response.status, "re-ACKing retransmitted final");
                    self.send_ack_for(data, &response).await?;
                }
                Ok(None)
            }
            other => {
                trace!(id = %data.key, state = ?other, "response ignored in this state");
                Ok(None)
            }
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<ClientTransactionData>,
        timer_name: &str,
        current_state: TransactionState,
        timer_handles: &mut ClientTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (timer_name, current_state) {
            ("A", TransactionState::Calling) => {
                debug!(id = %data.key, "Timer A fired, retransmitting INVITE");
                data.send_request_to_peer().await?;
                let iteration = data.next_retransmit_iteration();
                // Timer A doubles without the T2 cap.
                let interval = calculate_backoff_interval(
                    data.timer_factory.settings().t1,
                    iteration + 1,
                    None,
                );
                if let Some(old) = timer_handles.retransmit.take() {
                    old.abort();
                }
                timer_handles.retransmit =
                    Some(data.timer_factory.start_timer(data.key.clone(), TimerType::A, interval));
                Ok(None)
            }
            ("B", TransactionState::Calling) | ("B", TransactionState::Proceeding) => {
                debug!(id = %data.key, "Timer B fired, transaction timed out");
                data.events_tx
                    .send(TransactionEvent::TransactionTimeout {
                        transaction_id: data.key.clone(),
                        kind: self.kind(),
                    })
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
                Ok(Some(TransactionState::Terminated))
            }
            ("D", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
            (name, state) => {
                trace!(id = %data.key, timer = name, state = ?state, "stale timer ignored");
                Ok(None)
            }
        }
    }
}
