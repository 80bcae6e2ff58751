//! Non-INVITE client transaction (RFC 3261 section 17.1.2).

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

/// State machine for the non-INVITE client transaction.
///
/// Trying: request sent, Timer E retransmits (doubling, capped at T2),
/// Timer F bounds the attempt. A 1xx moves to Proceeding where E keeps
/// firing at the T2 cap and F is re-armed. Any final response moves to
/// Completed, where Timer K absorbs response retransmissions before
/// termination (zero on reliable transports).
#[derive(Debug, Default)]
pub struct NonInviteClientLogic;

#[async_trait]
impl TransactionLogic<ClientTransactionData, ClientTimerHandles> for NonInviteClientLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteClient
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
            TransactionState::Trying => {
                data.send_request_to_peer().await?;
                data.reset_retransmit_count();
                if !data.is_reliable() {
                    let interval = data.timer_factory.settings().t1;
                    timer_handles.retransmit = Some(data.timer_factory.start_timer(
                        data.key.clone(),
                        TimerType::E,
                        interval,
                    ));
                }
                timer_handles.timeout = Some(
                    data.timer_factory
                        .start_standard_timer(data.key.clone(), TimerType::F),
                );
            }
            TransactionState::Proceeding => {
                // Timer E continues at the T2 cap; Timer F is re-armed.
                if !data.is_reliable() {
                    let interval = data.timer_factory.settings().t2;
                    timer_handles.retransmit = Some(data.timer_factory.start_timer(
                        data.key.clone(),
                        TimerType::E,
                        interval,
                    ));
                }
                timer_handles.timeout = Some(
                    data.timer_factory
                        .start_standard_timer(data.key.clone(), TimerType::F),
                );
            }
            TransactionState::Completed => {
                if data.is_reliable() {
                    // Timer K is zero on reliable transports.
                    let _ = self_sender
                        .send(InternalTransactionCommand::TransitionTo(
                            TransactionState::Terminated,
                        ))
                        .await;
                } else {
                    timer_handles.wait = Some(
                        data.timer_factory
                            .start_standard_timer(data.key.clone(), TimerType::K),
                    );
                }
            }
            TransactionState::Terminated => {}
            other => {
                warn!(id = %data.key, state = ?other, "unexpected state for non-INVITE client");
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
            TransactionState::Trying | TransactionState::Proceeding => {
                if response.status.is_provisional() {
                    data.events_tx
                        .send(TransactionEvent::ProvisionalResponse {
                            transaction_id: data.key.clone(),
                            response,
                        })
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                    if current_state == TransactionState::Trying {
                        return Ok(Some(TransactionState::Proceeding));
                    }
                    return Ok(None);
                }

                let event = if response.status.is_success() {
                    TransactionEvent::SuccessResponse {
                        transaction_id: data.key.clone(),
                        response,
                        remote_addr: data.remote_addr,
                    }
                } else {
                    TransactionEvent::FailureResponse {
                        transaction_id: data.key.clone(),
                        response,
                    }
                };
                data.events_tx
                    .send(event)
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
                Ok(Some(TransactionState::Completed))
            }
            other => {
                // Retransmitted finals in Completed are absorbed silently.
                trace!(id = %data.key, state = ?other, status = %response.status,
                    "response ignored in this state");
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
            ("E", TransactionState::Trying) | ("E", TransactionState::Proceeding) => {
                debug!(id = %data.key, "Timer E fired, retransmitting request");
                data.send_request_to_peer().await?;
                let iteration = data.next_retransmit_iteration();
                let settings = data.timer_factory.settings();
                // In Proceeding the interval pegs at T2; the cap handles both.
                let interval =
                    calculate_backoff_interval(settings.t1, iteration + 1, Some(settings.t2));
                if let Some(old) = timer_handles.retransmit.take() {
                    old.abort();
                }
                timer_handles.retransmit =
                    Some(data.timer_factory.start_timer(data.key.clone(), TimerType::E, interval));
                Ok(None)
            }
            ("F", TransactionState::Trying) | ("F", TransactionState::Proceeding) => {
                debug!(id = %data.key, "Timer F fired, transaction timed out");
                data.events_tx
                    .send(TransactionEvent::TransactionTimeout {
                        transaction_id: data.key.clone(),
                        kind: self.kind(),
                    })
                    .await
                    .map_err(|_| Error::ChannelClosed)?;
                Ok(Some(TransactionState::Terminated))
            }
            ("K", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
            (name, state) => {
                trace!(id = %data.key, timer = name, state = ?state, "stale timer ignored");
                Ok(None)
            }
        }
    }
}
