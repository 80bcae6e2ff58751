//! Generic transaction event loop.
//!
//! RFC 3261 section 17 defines four state machines, but all four share one
//! execution shape: receive a message or a timer, consult the current
//! state, maybe transition, rearm timers for the new state. This module
//! implements that shape once; the per-kind behavior lives behind
//! [`TransactionLogic`] and the loop stays ignorant of which machine it is
//! driving.
//!
//! Each live transaction owns one tokio task running this loop. The task
//! is the sole consumer of the transaction's command channel, so state
//! writes are serialized without locks; timers and the registry only ever
//! *send* commands.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::transaction::logic::TransactionLogic;
use crate::transaction::{
    AtomicTransactionState, InternalTransactionCommand, TransactionEvent, TransactionKey,
    TransactionState,
};

/// Drive a transaction until it terminates.
///
/// Consumes commands from `cmd_rx` and delegates kind-specific decisions
/// to `logic`. Exits when the state reaches `Terminated`, when a
/// `Terminate` command arrives, or when the channel closes; a
/// `TransactionTerminated` event is emitted on the way out so the registry
/// can reap the entry.
pub async fn run_transaction_loop<D, TH, L>(
    data: Arc<D>,
    logic: Arc<L>,
    mut cmd_rx: mpsc::Receiver<InternalTransactionCommand>,
) where
    D: AsRefState + AsRefKey + HasTransactionEvents + HasCommandSender + Send + Sync + 'static,
    TH: Default + Send + Sync + 'static,
    L: TransactionLogic<D, TH> + Send + Sync + 'static,
{
    let mut timer_handles = TH::default();
    let tx_id = data.as_ref_key().clone();

    debug!(id = %tx_id, kind = ?logic.kind(), state = ?data.as_ref_state().get(),
        "transaction loop starting");

    while let Some(command) = cmd_rx.recv().await {
        let current_state = data.as_ref_state().get();

        match command {
            InternalTransactionCommand::TransitionTo(new_state) => {
                if current_state == new_state {
                    trace!(id = %tx_id, state = ?current_state, "already in requested state");
                    continue;
                }

                if let Err(e) =
                    AtomicTransactionState::validate_transition(logic.kind(), current_state, new_state)
                {
                    error!(id = %tx_id, error = %e, "rejected state transition");
                    let _ = data
                        .get_tu_event_sender()
                        .send(TransactionEvent::Error {
                            transaction_id: Some(tx_id.clone()),
                            error: e.to_string(),
                        })
                        .await;
                    continue;
                }

                logic.cancel_all_specific_timers(&mut timer_handles);
                let previous_state = data.as_ref_state().set(new_state);
                debug!(id = %tx_id, from = ?previous_state, to = ?new_state, "state changed");

                if data
                    .get_tu_event_sender()
                    .send(TransactionEvent::StateChanged {
                        transaction_id: tx_id.clone(),
                        previous_state,
                        new_state,
                    })
                    .await
                    .is_err()
                {
                    // TU is gone; nothing left to serve.
                    warn!(id = %tx_id, "event channel closed, terminating transaction");
                    logic.cancel_all_specific_timers(&mut timer_handles);
                    data.as_ref_state().set(TransactionState::Terminated);
                    break;
                }

                if let Err(e) = logic
                    .on_enter_state(
                        &data,
                        new_state,
                        previous_state,
                        &mut timer_handles,
                        data.get_self_command_sender(),
                    )
                    .await
                {
                    error!(id = %tx_id, error = %e, state = ?new_state, "on_enter_state failed");
                    report_error(&data, &tx_id, &e).await;
                    if matches!(e, Error::TransportFailure { .. }) {
                        // A transaction that cannot send cannot make progress.
                        let _ = data
                            .get_self_command_sender()
                            .send(InternalTransactionCommand::TransitionTo(
                                TransactionState::Terminated,
                            ))
                            .await;
                    }
                }
            }

            InternalTransactionCommand::ProcessMessage(message) => {
                match logic
                    .process_message(&data, message, current_state, &mut timer_handles)
                    .await
                {
                    Ok(Some(next_state)) => {
                        if let Err(e) = data
                            .get_self_command_sender()
                            .send(InternalTransactionCommand::TransitionTo(next_state))
                            .await
                        {
                            error!(id = %tx_id, error = %e, "failed to queue transition");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(id = %tx_id, error = %e, state = ?current_state,
                            "error processing message");
                        report_error(&data, &tx_id, &e).await;
                    }
                }
            }

            InternalTransactionCommand::Timer(timer_name) => {
                match logic
                    .handle_timer(&data, &timer_name, current_state, &mut timer_handles)
                    .await
                {
                    Ok(Some(next_state)) => {
                        if let Err(e) = data
                            .get_self_command_sender()
                            .send(InternalTransactionCommand::TransitionTo(next_state))
                            .await
                        {
                            error!(id = %tx_id, error = %e, "failed to queue transition");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(id = %tx_id, error = %e, timer = %timer_name,
                            state = ?current_state, "error handling timer");
                        report_error(&data, &tx_id, &e).await;
                    }
                }
            }

            InternalTransactionCommand::TransportError => {
                error!(id = %tx_id, "transport error, terminating transaction");
                let _ = data
                    .get_tu_event_sender()
                    .send(TransactionEvent::TransportError {
                        transaction_id: tx_id.clone(),
                    })
                    .await;
                let _ = data
                    .get_self_command_sender()
                    .send(InternalTransactionCommand::TransitionTo(
                        TransactionState::Terminated,
                    ))
                    .await;
            }

            InternalTransactionCommand::Terminate => {
                debug!(id = %tx_id, "terminate command received");
                logic.cancel_all_specific_timers(&mut timer_handles);
                data.as_ref_state().set(TransactionState::Terminated);
                break;
            }
        }

        if data.as_ref_state().get() == TransactionState::Terminated {
            break;
        }
    }

    logic.cancel_all_specific_timers(&mut timer_handles);
    let final_state = data.as_ref_state().get();
    debug!(id = %tx_id, ?final_state, "transaction loop ended");

    if final_state == TransactionState::Terminated {
        // Receiver may already be gone during shutdown; that is fine.
        let _ = data
            .get_tu_event_sender()
            .send(TransactionEvent::TransactionTerminated {
                transaction_id: tx_id,
            })
            .await;
    }
}

async fn report_error<D>(data: &Arc<D>, tx_id: &TransactionKey, error: &Error)
where
    D: HasTransactionEvents,
{
    let _ = data
        .get_tu_event_sender()
        .send(TransactionEvent::Error {
            transaction_id: Some(tx_id.clone()),
            error: error.to_string(),
        })
        .await;
}

/// Access to the transaction's atomic state cell.
pub trait AsRefState {
    fn as_ref_state(&self) -> &Arc<AtomicTransactionState>;
}

/// Access to the transaction's key.
pub trait AsRefKey {
    fn as_ref_key(&self) -> &TransactionKey;
}

/// Access to the channel carrying events to the Transaction User.
pub trait HasTransactionEvents {
    fn get_tu_event_sender(&self) -> mpsc::Sender<TransactionEvent>;
}

/// Access to the transport collaborator.
pub trait HasTransport {
    fn get_transport_layer(&self) -> Arc<dyn sipline_sip_transport::Transport>;
}

/// Access to the transaction's own command channel, used by timers and the
/// machine itself to queue follow-up work.
pub trait HasCommandSender {
    fn get_self_command_sender(&self) -> mpsc::Sender<InternalTransactionCommand>;
}
