//! Dialog layer configuration.

use std::time::Duration;

use sipline_transaction_core::TimerSettings;

/// Tunables for [`DialogManager`](crate::manager::DialogManager).
#[derive(Debug, Clone)]
pub struct DialogConfig {
    /// Timer settings shared with the transaction layer. The 2xx
    /// retransmission schedule (T1 doubling, capped at T2, bounded by
    /// 64*T1) derives from these.
    pub timer_settings: TimerSettings,

    /// How long an early dialog may stay unconfirmed before it is
    /// timed out and removed.
    pub early_dialog_timeout: Duration,

    /// How long to wait for re-INVITE serialization before failing the
    /// send with `AckPending`.
    pub ack_gate_timeout: Duration,

    /// How long a terminated dialog lingers in the table so that late
    /// retransmissions still match it instead of looking like strays.
    pub linger_duration: Duration,

    /// Reject in-dialog requests whose CSeq does not strictly increase.
    /// Disabled for interop with broken peers.
    pub cseq_validation: bool,

    /// Treat dialogs as back-to-back legs: serialize re-INVITEs through
    /// the ACK gate.
    pub enforce_ack_gate: bool,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            timer_settings: TimerSettings::default(),
            early_dialog_timeout: Duration::from_secs(180),
            ack_gate_timeout: Duration::from_secs(2),
            linger_duration: Duration::from_secs(32),
            cseq_validation: true,
            enforce_ack_gate: true,
        }
    }
}

impl DialogConfig {
    /// Aggressively shortened intervals so lifecycle tests complete in
    /// milliseconds.
    pub fn fast_for_tests() -> Self {
        Self {
            timer_settings: TimerSettings::fast_for_tests(),
            early_dialog_timeout: Duration::from_millis(200),
            ack_gate_timeout: Duration::from_millis(100),
            linger_duration: Duration::from_millis(50),
            cseq_validation: true,
            enforce_ack_gate: true,
        }
    }

    /// Upper bound on waiting for the peer's ACK to a 2xx we sent
    /// (64*T1, the same ceiling the transaction layer uses).
    pub fn ack_wait(&self) -> Duration {
        self.timer_settings.transaction_timeout
    }
}
