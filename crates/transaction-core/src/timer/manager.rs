//! Timer execution and sender resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::transaction::{InternalTransactionCommand, TransactionKey};

/// Routes timer expirations to live transactions.
///
/// Transactions register their command sender under their key; a timer
/// task carries only the key and looks the sender up when it fires. An
/// expiration for an unregistered key is dropped silently, which is the
/// normal fate of timers racing transaction teardown.
#[derive(Debug, Default)]
pub struct TimerManager {
    senders: Mutex<HashMap<TransactionKey, mpsc::Sender<InternalTransactionCommand>>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_transaction(
        &self,
        key: TransactionKey,
        sender: mpsc::Sender<InternalTransactionCommand>,
    ) {
        self.senders.lock().await.insert(key, sender);
    }

    pub async fn unregister_transaction(&self, key: &TransactionKey) {
        self.senders.lock().await.remove(key);
    }

    /// Schedule a one-shot timer. The returned handle can be aborted to
    /// cancel; firing sends `Timer(name)` on the transaction's command
    /// channel if the transaction is still registered.
    pub fn start_timer(
        self: &Arc<Self>,
        key: TransactionKey,
        name: &'static str,
        duration: Duration,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let sender = manager.senders.lock().await.get(&key).cloned();
            match sender {
                Some(tx) => {
                    trace!(id = %key, timer = name, "timer fired");
                    let _ = tx
                        .send(InternalTransactionCommand::Timer(name.to_string()))
                        .await;
                }
                None => {
                    trace!(id = %key, timer = name, "timer fired after unregister, dropped");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipline_sip_core::Method;

    fn key() -> TransactionKey {
        TransactionKey::new("z9hG4bKtimer", Method::Invite, false)
    }

    #[tokio::test]
    async fn fires_into_registered_channel() {
        let manager = Arc::new(TimerManager::new());
        let (tx, mut rx) = mpsc::channel(4);
        manager.register_transaction(key(), tx).await;

        manager.start_timer(key(), "A", Duration::from_millis(5));
        match rx.recv().await {
            Some(InternalTransactionCommand::Timer(name)) => assert_eq!(name, "A"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropped_after_unregister() {
        let manager = Arc::new(TimerManager::new());
        let (tx, mut rx) = mpsc::channel(4);
        manager.register_transaction(key(), tx).await;
        manager.unregister_transaction(&key()).await;

        let handle = manager.start_timer(key(), "B", Duration::from_millis(5));
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn aborted_timer_never_fires() {
        let manager = Arc::new(TimerManager::new());
        let (tx, mut rx) = mpsc::channel(4);
        manager.register_transaction(key(), tx).await;

        let handle = manager.start_timer(key(), "D", Duration::from_millis(20));
        handle.abort();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
    }
}
