//! Dialog identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Full dialog identifier: (Call-ID, local tag, remote tag), RFC 3261
/// section 12. Both tags must be known; before that an [`EarlyDialogId`]
/// is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Identifier used while the remote tag is not yet fixed: a UAC knows
/// only its Call-ID and its own (From) tag until a tagged response
/// arrives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EarlyDialogId {
    pub call_id: String,
    pub local_tag: String,
}

impl EarlyDialogId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
        }
    }

    /// Complete the identity once the remote tag is learned.
    pub fn with_remote_tag(&self, remote_tag: impl Into<String>) -> DialogId {
        DialogId::new(self.call_id.clone(), self.local_tag.clone(), remote_tag)
    }
}

impl fmt::Display for EarlyDialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:?", self.call_id, self.local_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_id_completion() {
        let early = EarlyDialogId::new("c1", "lt");
        let full = early.with_remote_tag("rt");
        assert_eq!(full, DialogId::new("c1", "lt", "rt"));
        assert_eq!(full.to_string(), "c1:lt:rt");
    }
}
