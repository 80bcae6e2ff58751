//! Dialog lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a dialog, RFC 3261 section 12.
///
/// `Initial` covers a dialog object that exists but has not yet seen the
/// response/request that fixes both tags. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    Initial,
    /// Tagged provisional seen/sent; media may already flow.
    Early,
    /// 2xx exchanged; the dialog is fully established.
    Confirmed,
    Terminated,
}

impl DialogState {
    /// Whether moving to `next` is legal. Early never goes back to
    /// Initial, Confirmed never back to Early, and nothing leaves
    /// Terminated.
    pub fn can_transition_to(self, next: DialogState) -> bool {
        use DialogState::*;
        match (self, next) {
            (state, to) if state == to => true,
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Initial, Early) | (Initial, Confirmed) | (Early, Confirmed) => true,
            _ => false,
        }
    }

    pub fn is_terminated(self) -> bool {
        self == DialogState::Terminated
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DialogState::Initial => "Initial",
            DialogState::Early => "Early",
            DialogState::Confirmed => "Confirmed",
            DialogState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DialogState::*;

    #[test]
    fn transitions() {
        assert!(Initial.can_transition_to(Early));
        assert!(Early.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Terminated));
        assert!(Early.can_transition_to(Terminated));

        assert!(!Confirmed.can_transition_to(Early));
        assert!(!Early.can_transition_to(Initial));
        assert!(!Terminated.can_transition_to(Confirmed));
        assert!(Terminated.can_transition_to(Terminated));
    }
}
