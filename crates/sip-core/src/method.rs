//! SIP request methods.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A SIP request method.
///
/// The engine only dispatches on the methods it has special handling for;
/// anything else travels as `Extension` and follows the non-INVITE state
/// machines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Message,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Extension(String),
}

impl Method {
    /// Whether a request with this method establishes a dialog when it
    /// receives a tagged 1xx/2xx response (RFC 3261 section 12.1,
    /// RFC 6665 for SUBSCRIBE, RFC 3515 for REFER).
    pub fn creates_dialog(&self) -> bool {
        matches!(self, Method::Invite | Method::Subscribe | Method::Refer)
    }

    /// Whether this method is a target-refresh request: its Contact may
    /// update the dialog's remote target (but never the route set).
    pub fn is_target_refresh(&self) -> bool {
        matches!(self, Method::Invite | Method::Update | Method::Subscribe | Method::Notify)
    }

    pub fn is_invite(&self) -> bool {
        *self == Method::Invite
    }

    pub fn is_ack(&self) -> bool {
        *self == Method::Ack
    }

    /// Canonical upper-case name.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Extension(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = InvalidMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidMethod);
        }
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "MESSAGE" => Method::Message,
            "INFO" => Method::Info,
            "UPDATE" => Method::Update,
            "PRACK" => Method::Prack,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            other => Method::Extension(other.to_string()),
        })
    }
}

/// Error for an empty method token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidMethod;

impl fmt::Display for InvalidMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid SIP method")
    }
}

impl std::error::Error for InvalidMethod {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_known_methods() {
        for name in ["INVITE", "ACK", "BYE", "CANCEL", "PRACK", "SUBSCRIBE"] {
            let method: Method = name.parse().unwrap();
            assert_eq!(method.to_string(), name);
        }
    }

    #[test]
    fn unknown_method_is_extension() {
        let method: Method = "PUBLISH".parse().unwrap();
        assert_eq!(method, Method::Extension("PUBLISH".to_string()));
        assert_eq!(method.as_str(), "PUBLISH");
    }

    #[test]
    fn dialog_creating_methods() {
        assert!(Method::Invite.creates_dialog());
        assert!(Method::Subscribe.creates_dialog());
        assert!(!Method::Bye.creates_dialog());
        assert!(!Method::Ack.creates_dialog());
    }
}
