//! Timer identities and the tunable durations behind them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The named RFC 3261 transaction timers (table in section 17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerType {
    /// INVITE client request retransmission (doubles without cap).
    A,
    /// INVITE client transaction timeout.
    B,
    /// INVITE client wait in Completed (absorb response retransmissions).
    D,
    /// Non-INVITE client request retransmission (doubles, capped at T2).
    E,
    /// Non-INVITE client transaction timeout.
    F,
    /// INVITE server non-2xx response retransmission (doubles, capped at T2).
    G,
    /// INVITE server wait for ACK.
    H,
    /// INVITE server wait in Confirmed (absorb ACK retransmissions).
    I,
    /// Non-INVITE server wait in Completed (absorb request retransmissions).
    J,
    /// Non-INVITE client wait in Completed (absorb response retransmissions).
    K,
}

impl TimerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerType::A => "A",
            TimerType::B => "B",
            TimerType::D => "D",
            TimerType::E => "E",
            TimerType::F => "F",
            TimerType::G => "G",
            TimerType::H => "H",
            TimerType::I => "I",
            TimerType::J => "J",
            TimerType::K => "K",
        }
    }
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations for the base timers and the waits derived from them.
///
/// Defaults follow RFC 3261 section 17.1.1.1: T1 = 500 ms (RTT estimate),
/// T2 = 4 s (retransmission cap), T4 = 5 s (max message lifetime in the
/// network). Tests shrink these to keep the suite fast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    /// Timers B, F, and H: 64 x T1.
    pub transaction_timeout: Duration,
    /// Timer D on unreliable transports (at least 32 s).
    pub wait_time_d: Duration,
    /// Timer I on unreliable transports (= T4).
    pub wait_time_i: Duration,
    /// Timer J on unreliable transports (64 x T1).
    pub wait_time_j: Duration,
    /// Timer K on unreliable transports (= T4).
    pub wait_time_k: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        let t1 = Duration::from_millis(500);
        Self {
            t1,
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            transaction_timeout: t1 * 64,
            wait_time_d: Duration::from_secs(32),
            wait_time_i: Duration::from_secs(5),
            wait_time_j: t1 * 64,
            wait_time_k: Duration::from_secs(5),
        }
    }
}

impl TimerSettings {
    /// Scaled-down settings for tests: same ratios, milliseconds instead
    /// of seconds, so full timer ladders run in tens of milliseconds.
    pub fn fast_for_tests() -> Self {
        let t1 = Duration::from_millis(10);
        Self {
            t1,
            t2: Duration::from_millis(80),
            t4: Duration::from_millis(100),
            transaction_timeout: t1 * 64,
            wait_time_d: Duration::from_millis(200),
            wait_time_i: Duration::from_millis(100),
            wait_time_j: t1 * 64,
            wait_time_k: Duration::from_millis(100),
        }
    }
}
