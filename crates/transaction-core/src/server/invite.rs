//! INVITE server transaction (RFC 3261 section 17.2.1, RFC 3262 for
//! reliable provisionals).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use sipline_sip_core::{Message, Method, Request, Response, StatusCode};

use crate::error::{Error, Result};
use crate::server::{ServerTimerHandles, ServerTransactionData};
use crate::timer::{calculate_backoff_interval, TimerType};
use crate::transaction::logic::TransactionLogic;
use crate::transaction::{
    InternalTransactionCommand, TransactionEvent, TransactionKind, TransactionState,
};

/// Timer names for the RFC 3262 provisional-reliability ladder. These are
/// engine-internal; they sit alongside the lettered RFC 3261 timers.
const TIMER_REL_RETRANSMIT: &str = "RelG";
const TIMER_REL_TIMEOUT: &str = "RelH";

/// State machine for the INVITE server transaction.
///
/// Proceeding: a 100 Trying goes out immediately; TU provisionals
/// (including 100rel ones, which get a monotonic RSeq and a PRACK wait)
/// follow. A non-2xx final moves to Completed with Timer G retransmitting
/// it and Timer H bounding the ACK wait; the ACK moves to Confirmed where
/// Timer I absorbs ACK retransmissions. A 2xx final also parks the
/// transaction in Completed, but the 2xx retransmission schedule belongs
/// to the dialog layer; the transaction just waits for the ACK
/// notification (or Timer H) to terminate.
#[derive(Debug, Default)]
pub struct InviteServerLogic;

impl InviteServerLogic {
    /// Handle a response handed down by the TU for transmission.
    async fn process_tu_response(
        &self,
        data: &Arc<ServerTransactionData>,
        mut response: Response,
        current_state: TransactionState,
        timer_handles: &mut ServerTimerHandles,
    ) -> Result<Option<TransactionState>> {
        if matches!(
            current_state,
            TransactionState::Completed | TransactionState::Confirmed | TransactionState::Terminated
        ) {
            warn!(id = %data.key, status = %response.status, state = ?current_state,
                "TU response after final, dropped");
            return Ok(None);
        }

        if response.status.is_provisional() {
            // A provisional with the RSeq marker set is sent reliably:
            // the engine owns the actual sequence number.
            if response.rseq.is_some() {
                let mut rel = data.rel.lock().await;
                if rel.unacked.is_some() {
                    // RFC 3262: one unacknowledged reliable provisional at
                    // a time.
                    warn!(id = %data.key, "reliable provisional already pending, dropped");
                    return Ok(None);
                }
                let rseq = rel.next_rseq;
                rel.next_rseq += 1;
                response.rseq = Some(rseq);
                rel.unacked = Some((rseq, response.clone()));
                drop(rel);

                data.reset_retransmit_count();
                let settings = data.timer_factory.settings().clone();
                timer_handles.rel_retransmit = Some(data.timer_factory.manager().start_timer(
                    data.key.clone(),
                    TIMER_REL_RETRANSMIT,
                    settings.t1,
                ));
                timer_handles.rel_timeout = Some(data.timer_factory.manager().start_timer(
                    data.key.clone(),
                    TIMER_REL_TIMEOUT,
                    settings.transaction_timeout,
                ));
            }
            *data.last_response.lock().await = Some(response.clone());
            data.send_response_to_peer(&response).await?;
            return Ok(None);
        }

        // Final response.
        *data.last_response.lock().await = Some(response.clone());
        data.send_response_to_peer(&response).await?;
        Ok(Some(TransactionState::Completed))
    }

    async fn process_peer_request(
        &self,
        data: &Arc<ServerTransactionData>,
        request: Request,
        current_state: TransactionState,
        timer_handles: &mut ServerTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match request.method {
            Method::Invite => {
                // Retransmitted INVITE: answer with whatever we last sent.
                trace!(id = %data.key, "retransmitted INVITE, resending last response");
                data.retransmit_last_response().await?;
                Ok(None)
            }
            Method::Ack => match current_state {
                TransactionState::Completed => {
                    let success = data.final_is_success().await;
                    data.events_tx
                        .send(TransactionEvent::AckReceived {
                            transaction_id: data.key.clone(),
                            request,
                        })
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                    if success {
                        // The 2xx handshake is complete; nothing to absorb.
                        Ok(Some(TransactionState::Terminated))
                    } else {
                        Ok(Some(TransactionState::Confirmed))
                    }
                }
                TransactionState::Confirmed => {
                    // Retransmitted ACK: idempotent no-op.
                    trace!(id = %data.key, "retransmitted ACK absorbed");
                    Ok(None)
                }
                other => {
                    trace!(id = %data.key, state = ?other, "ACK ignored in this state");
                    Ok(None)
                }
            },
            Method::Prack => {
                let rack = match &request.rack {
                    Some(r) => r.clone(),
                    None => {
                        warn!(id = %data.key, "PRACK without RAck, dropped");
                        return Ok(None);
                    }
                };
                let matched = {
                    let mut rel = data.rel.lock().await;
                    let matched = match (&rel.unacked, &data.request.cseq) {
                        (Some((rseq, _)), Some(cseq)) => rack.matches(*rseq, cseq),
                        _ => false,
                    };
                    if matched {
                        rel.unacked = None;
                    }
                    matched
                };
                if matched {
                    timer_handles.abort_rel_timers();
                    data.events_tx
                        .send(TransactionEvent::PrackReceived {
                            transaction_id: data.key.clone(),
                            request,
                        })
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                } else {
                    // Non-matching PRACKs are dropped, not answered here.
                    debug!(id = %data.key, "PRACK does not match pending provisional, dropped");
                }
                Ok(None)
            }
            ref other => {
                warn!(id = %data.key, method = %other, "unexpected request method");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TransactionLogic<ServerTransactionData, ServerTimerHandles> for InviteServerLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteServer
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
            TransactionState::Proceeding => {
                // Answer retransmissions right away while the TU decides.
                let mut last = data.last_response.lock().await;
                if last.is_none() {
                    let trying = Response::for_request(StatusCode::TRYING, &data.request);
                    data.send_response_to_peer(&trying).await?;
                    *last = Some(trying);
                }
            }
            TransactionState::Completed => {
                data.reset_retransmit_count();
                let success = data.final_is_success().await;
                if !success && !data.is_reliable() {
                    timer_handles.retransmit = Some(data.timer_factory.start_timer(
                        data.key.clone(),
                        TimerType::G,
                        data.timer_factory.settings().t1,
                    ));
                }
                timer_handles.ack_wait = Some(
                    data.timer_factory
                        .start_standard_timer(data.key.clone(), TimerType::H),
                );
            }
            TransactionState::Confirmed => {
                if data.is_reliable() {
                    // Timer I is zero on reliable transports.
                    let _ = self_sender
                        .send(InternalTransactionCommand::TransitionTo(
                            TransactionState::Terminated,
                        ))
                        .await;
                } else {
                    timer_handles.wait = Some(
                        data.timer_factory
                            .start_standard_timer(data.key.clone(), TimerType::I),
                    );
                }
            }
            TransactionState::Terminated => {}
            other => {
                warn!(id = %data.key, state = ?other, "unexpected state for INVITE server");
            }
        }
        Ok(())
    }

    async fn process_message(
        &self,
        data: &Arc<ServerTransactionData>,
        message: Message,
        current_state: TransactionState,
        timer_handles: &mut ServerTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match message {
            Message::Request(request) => {
                self.process_peer_request(data, request, current_state, timer_handles)
                    .await
            }
            Message::Response(response) => {
                self.process_tu_response(data, response, current_state, timer_handles)
                    .await
            }
        }
    }

    async fn handle_timer(
        &self,
        data: &Arc<ServerTransactionData>,
        timer_name: &str,
        current_state: TransactionState,
        timer_handles: &mut ServerTimerHandles,
    ) -> Result<Option<TransactionState>> {
        match (timer_name, current_state) {
            ("G", TransactionState::Completed) => {
                if data.final_is_success().await {
                    // 2xx retransmission belongs to the dialog layer.
                    return Ok(None);
                }
                debug!(id = %data.key, "Timer G fired, retransmitting final response");
                data.retransmit_last_response().await?;
                let iteration = data.next_retransmit_iteration();
                let settings = data.timer_factory.settings();
                let interval =
                    calculate_backoff_interval(settings.t1, iteration + 1, Some(settings.t2));
                if let Some(old) = timer_handles.retransmit.take() {
                    old.abort();
                }
                timer_handles.retransmit =
                    Some(data.timer_factory.start_timer(data.key.clone(), TimerType::G, interval));
                Ok(None)
            }
            ("H", TransactionState::Completed) => {
                if data.final_is_success().await {
                    // The dialog layer already raised ACK-not-received if it
                    // cared; the transaction just leaves quietly.
                    debug!(id = %data.key, "ACK wait for 2xx elapsed, terminating");
                } else {
                    debug!(id = %data.key, "Timer H fired, no ACK for non-2xx final");
                    data.events_tx
                        .send(TransactionEvent::TransactionTimeout {
                            transaction_id: data.key.clone(),
                            kind: self.kind(),
                        })
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                }
                Ok(Some(TransactionState::Terminated))
            }
            ("I", TransactionState::Confirmed) => Ok(Some(TransactionState::Terminated)),
            (TIMER_REL_RETRANSMIT, TransactionState::Proceeding) => {
                let unacked = data.rel.lock().await.unacked.clone();
                let Some((rseq, response)) = unacked else {
                    return Ok(None);
                };
                trace!(id = %data.key, rseq, "retransmitting reliable provisional");
                data.send_response_to_peer(&response).await?;
                let iteration = data.next_retransmit_iteration();
                let settings = data.timer_factory.settings();
                let interval =
                    calculate_backoff_interval(settings.t1, iteration + 1, Some(settings.t2));
                if let Some(old) = timer_handles.rel_retransmit.take() {
                    old.abort();
                }
                timer_handles.rel_retransmit = Some(data.timer_factory.manager().start_timer(
                    data.key.clone(),
                    TIMER_REL_RETRANSMIT,
                    interval,
                ));
                Ok(None)
            }
            (TIMER_REL_TIMEOUT, TransactionState::Proceeding) => {
                let had_pending = {
                    let mut rel = data.rel.lock().await;
                    rel.unacked.take().is_some()
                };
                timer_handles.abort_rel_timers();
                if had_pending {
                    warn!(id = %data.key, "no PRACK for reliable provisional");
                    data.events_tx
                        .send(TransactionEvent::Error {
                            transaction_id: Some(data.key.clone()),
                            error: "reliable provisional was never acknowledged".to_string(),
                        })
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                }
                Ok(None)
            }
            (name, state) => {
                trace!(id = %data.key, timer = name, state = ?state, "stale timer ignored");
                Ok(None)
            }
        }
    }
}
