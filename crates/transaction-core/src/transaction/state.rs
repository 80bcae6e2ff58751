//! Transaction states and their thread-safe container.
//!
//! RFC 3261 section 17 defines four state machines (INVITE/non-INVITE,
//! client/server). All four share one state vocabulary; which states apply
//! depends on the [`TransactionKind`]. The container below stores the state
//! as an `AtomicU8` so timer tasks and the message path can read and write
//! it without a lock, and it clamps writes so a transaction can never
//! un-complete: once `Completed` only `Completed`/`Confirmed`/`Terminated`
//! may be stored, and `Terminated` is immutable.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::transaction::TransactionKind;

/// State of a SIP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Before the transaction has started its lifecycle. Not a named RFC
    /// state; covers the window between construction and the first send
    /// (client) or the first dispatched request (server).
    Initial,

    /// Client INVITE only: request sent, no response yet (17.1.1.2).
    Calling,

    /// Client non-INVITE: request sent, awaiting response (17.1.2.2).
    /// Server non-INVITE: request received, nothing sent yet (17.2.2).
    Trying,

    /// A provisional response has been received (client) or sent (server).
    Proceeding,

    /// A final response has been received (client) or sent (server).
    Completed,

    /// Server INVITE only: ACK received for a non-2xx final (17.2.1).
    Confirmed,

    /// Lifecycle over; the registry removes the entry after a linger.
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        *self == TransactionState::Terminated
    }

    /// Rank used for the monotonic-collapse clamp: states at or above
    /// `Completed` can never be left for a lower-ranked state.
    fn rank(self) -> u8 {
        self as u8
    }
}

/// Thread-safe holder for a [`TransactionState`].
#[derive(Debug)]
pub struct AtomicTransactionState {
    value: AtomicU8,
}

const STATES: [TransactionState; 7] = [
    TransactionState::Initial,
    TransactionState::Calling,
    TransactionState::Trying,
    TransactionState::Proceeding,
    TransactionState::Completed,
    TransactionState::Confirmed,
    TransactionState::Terminated,
];

fn decode(value: u8) -> TransactionState {
    STATES
        .get(value as usize)
        .copied()
        .unwrap_or(TransactionState::Terminated)
}

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        Self {
            value: AtomicU8::new(state as u8),
        }
    }

    pub fn get(&self) -> TransactionState {
        decode(self.value.load(Ordering::Acquire))
    }

    /// Store `new_state`, clamped to the monotonic-collapse invariant:
    /// `Terminated` is immutable, and from `Completed`/`Confirmed` only
    /// `Completed`/`Confirmed`/`Terminated` can be stored. Returns the
    /// previous state (which equals the surviving state when the write
    /// was clamped away).
    pub fn set(&self, new_state: TransactionState) -> TransactionState {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let current_state = decode(current);
            if current_state == TransactionState::Terminated {
                return current_state;
            }
            if current_state.rank() >= TransactionState::Completed.rank()
                && new_state.rank() < TransactionState::Completed.rank()
            {
                return current_state;
            }
            match self.value.compare_exchange(
                current,
                new_state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return decode(prev),
                Err(actual) => current = actual,
            }
        }
    }

    /// Compare-and-swap transition. Succeeds when the current state equals
    /// `current_state`, when it already equals `new_state`, or
    /// unconditionally when the target is `Terminated` (a transaction can
    /// always be killed).
    pub fn transition_if(
        &self,
        current_state: TransactionState,
        new_state: TransactionState,
    ) -> bool {
        match self.value.compare_exchange(
            current_state as u8,
            new_state as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(actual) => {
                if decode(actual) == new_state {
                    true
                } else if new_state == TransactionState::Terminated {
                    self.value
                        .store(TransactionState::Terminated as u8, Ordering::Release);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Validate a transition against the RFC 3261 state machine for the
    /// given kind. Same-state writes and transitions to `Terminated` are
    /// always valid; leaving `Terminated` never is.
    pub fn validate_transition(
        kind: TransactionKind,
        from: TransactionState,
        to: TransactionState,
    ) -> crate::error::Result<()> {
        use TransactionState::*;

        if from == to {
            return Ok(());
        }
        if from == Terminated {
            return Err(Error::invalid_state_transition(kind, from, to));
        }
        if to == Terminated {
            return Ok(());
        }

        let allowed = match kind {
            TransactionKind::InviteClient => matches!(
                (from, to),
                (Initial, Calling) | (Calling, Proceeding) | (Calling, Completed)
                    | (Proceeding, Completed)
            ),
            TransactionKind::NonInviteClient => matches!(
                (from, to),
                (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed)
                    | (Proceeding, Completed)
            ),
            TransactionKind::InviteServer => matches!(
                (from, to),
                (Initial, Proceeding)
                    | (Initial, Completed)
                    | (Proceeding, Completed)
                    | (Completed, Confirmed)
            ),
            TransactionKind::NonInviteServer => matches!(
                (from, to),
                (Initial, Trying)
                    | (Initial, Proceeding)
                    | (Trying, Proceeding)
                    | (Trying, Completed)
                    | (Proceeding, Completed)
            ),
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::invalid_state_transition(kind, from, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_roundtrip() {
        let state = AtomicTransactionState::new(TransactionState::Initial);
        assert_eq!(state.get(), TransactionState::Initial);
        assert_eq!(state.set(TransactionState::Calling), TransactionState::Initial);
        assert_eq!(state.get(), TransactionState::Calling);
    }

    #[test]
    fn terminated_is_immutable() {
        let state = AtomicTransactionState::new(TransactionState::Terminated);
        assert_eq!(
            state.set(TransactionState::Proceeding),
            TransactionState::Terminated
        );
        assert_eq!(state.get(), TransactionState::Terminated);
    }

    #[test]
    fn completed_cannot_regress() {
        let state = AtomicTransactionState::new(TransactionState::Completed);
        // Write below Completed is clamped away.
        state.set(TransactionState::Proceeding);
        assert_eq!(state.get(), TransactionState::Completed);
        // Confirmed and Terminated are still reachable.
        state.set(TransactionState::Confirmed);
        assert_eq!(state.get(), TransactionState::Confirmed);
        state.set(TransactionState::Terminated);
        assert_eq!(state.get(), TransactionState::Terminated);
    }

    #[test]
    fn transition_if_semantics() {
        let state = AtomicTransactionState::new(TransactionState::Trying);
        assert!(state.transition_if(TransactionState::Trying, TransactionState::Proceeding));
        assert_eq!(state.get(), TransactionState::Proceeding);

        // Mismatched expectation fails without changing state.
        assert!(!state.transition_if(TransactionState::Trying, TransactionState::Completed));
        assert_eq!(state.get(), TransactionState::Proceeding);

        // Already at target counts as success.
        assert!(state.transition_if(TransactionState::Initial, TransactionState::Proceeding));

        // Termination always wins.
        assert!(state.transition_if(TransactionState::Initial, TransactionState::Terminated));
        assert_eq!(state.get(), TransactionState::Terminated);
    }

    #[test]
    fn validate_invite_client_machine() {
        use TransactionState::*;
        let kind = TransactionKind::InviteClient;
        for (from, to) in [
            (Initial, Calling),
            (Calling, Proceeding),
            (Calling, Completed),
            (Proceeding, Completed),
            (Completed, Terminated),
            (Calling, Terminated),
        ] {
            assert!(AtomicTransactionState::validate_transition(kind, from, to).is_ok());
        }
        for (from, to) in [
            (Initial, Proceeding),
            (Calling, Trying),
            (Completed, Calling),
            (Terminated, Calling),
        ] {
            assert!(AtomicTransactionState::validate_transition(kind, from, to).is_err());
        }
    }

    #[test]
    fn invalid_transition_carries_the_offender() {
        use TransactionState::*;
        let err = AtomicTransactionState::validate_transition(
            TransactionKind::InviteClient,
            Terminated,
            Calling,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition {
                kind: TransactionKind::InviteClient,
                from: Terminated,
                to: Calling,
            }
        ));
    }

    #[test]
    fn validate_invite_server_machine() {
        use TransactionState::*;
        let kind = TransactionKind::InviteServer;
        for (from, to) in [
            (Initial, Proceeding),
            (Initial, Completed),
            (Proceeding, Completed),
            (Completed, Confirmed),
            (Confirmed, Terminated),
        ] {
            assert!(AtomicTransactionState::validate_transition(kind, from, to).is_ok());
        }
        for (from, to) in [(Initial, Calling), (Confirmed, Proceeding), (Completed, Proceeding)] {
            assert!(AtomicTransactionState::validate_transition(kind, from, to).is_err());
        }
    }

    #[test]
    fn validate_non_invite_machines() {
        use TransactionState::*;
        for kind in [TransactionKind::NonInviteClient, TransactionKind::NonInviteServer] {
            assert!(AtomicTransactionState::validate_transition(kind, Initial, Trying).is_ok());
            assert!(
                AtomicTransactionState::validate_transition(kind, Trying, Proceeding).is_ok()
            );
            assert!(AtomicTransactionState::validate_transition(kind, Trying, Completed).is_ok());
            assert!(AtomicTransactionState::validate_transition(kind, Initial, Calling).is_err());
        }
    }
}
