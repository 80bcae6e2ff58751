//! Serialized delivery of events to the Transaction User.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use crate::error::{Error, Result};
use crate::transaction::TransactionEvent;

/// A binary semaphore in front of the TU event channel.
///
/// At most one event is in flight toward the TU at a time, so a TU
/// callback never observes a second event racing the one it is handling.
/// Delivery is bounded by a timeout; a TU that stops draining its channel
/// loses events (with a warning) instead of wedging the engine.
#[derive(Debug, Clone)]
pub struct DeliveryGate {
    permit: Arc<Semaphore>,
    timeout: Duration,
}

impl DeliveryGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            timeout,
        }
    }

    /// Deliver `event` through `sender`, holding the gate's single permit
    /// for the duration of the send.
    pub async fn deliver(
        &self,
        sender: &mpsc::Sender<TransactionEvent>,
        event: TransactionEvent,
    ) -> Result<()> {
        // acquire() only fails if the semaphore is closed, which we never do.
        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| Error::ChannelClosed)?;
        match tokio::time::timeout(self.timeout, sender.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                warn!(timeout = ?self.timeout, "event delivery timed out, dropping event");
                Err(Error::Other("event delivery timed out".to_string()))
            }
        }
    }
}
