//! Re-INVITE serialization for back-to-back user agents.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::errors::{DialogError, DialogResult};

/// A binary permit serializing re-INVITEs on one dialog.
///
/// A B2BUA must not have two INVITEs in flight on the same dialog: the
/// peer would reject the second with a 491/500. Sending a re-INVITE
/// acquires the gate; sending or receiving the ACK for it releases the
/// gate. Acquisition waits a bounded time, then fails the send attempt
/// instead of blocking the caller forever. Dialogs not marked
/// back-to-back skip the gate entirely.
#[derive(Debug, Clone)]
pub struct AckGate {
    permit: Arc<Semaphore>,
    /// Set while the permit is held, so release is idempotent (an ACK
    /// both sent and received must free the gate exactly once).
    held: Arc<AtomicBool>,
    timeout: Duration,
    enforced: bool,
}

impl AckGate {
    pub fn new(enforced: bool, timeout: Duration) -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            held: Arc::new(AtomicBool::new(false)),
            timeout,
            enforced,
        }
    }

    /// Take the gate ahead of a re-INVITE. Waits up to the configured
    /// bound for the previous re-INVITE's ACK to be accounted for.
    pub async fn acquire(&self) -> DialogResult<()> {
        if !self.enforced {
            return Ok(());
        }
        match tokio::time::timeout(self.timeout, self.permit.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.held.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(_)) => Err(DialogError::Other("ack gate closed".to_string())),
            Err(_) => Err(DialogError::AckPending),
        }
    }

    /// Release the gate when an ACK is sent or received. Safe to call
    /// more than once per cycle and when the gate is not enforced.
    pub fn release(&self) {
        if self.enforced && self.held.swap(false, Ordering::SeqCst) {
            self.permit.add_permits(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let gate = AckGate::new(true, Duration::from_millis(30));
        gate.acquire().await.unwrap();

        // Held: the second acquire times out.
        let err = gate.acquire().await.unwrap_err();
        assert!(matches!(err, DialogError::AckPending));

        gate.release();
        gate.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let gate = AckGate::new(true, Duration::from_millis(30));
        gate.acquire().await.unwrap();
        gate.release();
        gate.release();
        // Only one permit came back; acquire-acquire still blocks.
        gate.acquire().await.unwrap();
        assert!(gate.acquire().await.is_err());
    }

    #[tokio::test]
    async fn unenforced_gate_never_blocks() {
        let gate = AckGate::new(false, Duration::from_millis(5));
        gate.acquire().await.unwrap();
        gate.acquire().await.unwrap();
        gate.release();
    }
}
