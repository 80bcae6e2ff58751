//! In-memory transport used by the engine's tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use sipline_sip_core::Message;

use crate::{Result, Transport, TransportError};

/// A transport that records every sent message and can be told to fail.
///
/// Tests inspect the send log with [`sent_messages`](MockTransport::sent_messages)
/// or await sends as they happen via the optional notification channel.
#[derive(Debug)]
pub struct MockTransport {
    local_addr: SocketAddr,
    reliable: bool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<(Message, SocketAddr)>>,
    notify_tx: Mutex<Option<mpsc::Sender<(Message, SocketAddr)>>>,
}

impl MockTransport {
    pub fn new(reliable: bool) -> Arc<Self> {
        Arc::new(Self {
            local_addr: "127.0.0.1:5060".parse().unwrap(),
            reliable,
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(None),
        })
    }

    pub fn udp() -> Arc<Self> {
        Self::new(false)
    }

    pub fn tcp() -> Arc<Self> {
        Self::new(true)
    }

    /// Make every subsequent send fail, simulating a dead peer.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of everything sent so far.
    pub async fn sent_messages(&self) -> Vec<(Message, SocketAddr)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn clear_sent(&self) {
        self.sent.lock().await.clear();
    }

    /// Register a channel that receives each message as it is sent.
    pub async fn subscribe_sends(&self) -> mpsc::Receiver<(Message, SocketAddr)> {
        let (tx, rx) = mpsc::channel(64);
        *self.notify_tx.lock().await = Some(tx);
        rx
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(&self, message: Message, destination: SocketAddr) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("mock failure".to_string()));
        }
        trace!(dest = %destination, msg = %message, "mock transport send");
        self.sent.lock().await.push((message.clone(), destination));
        if let Some(tx) = self.notify_tx.lock().await.as_ref() {
            let _ = tx.send((message, destination)).await;
        }
        Ok(())
    }

    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn transport_kind(&self) -> &'static str {
        if self.reliable {
            "TCP"
        } else {
            "UDP"
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
