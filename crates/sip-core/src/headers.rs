//! Typed header values the engine inspects.
//!
//! Only the headers that drive transaction matching, dialog identity, and
//! reliable-provisional handling are modeled. Everything else stays opaque
//! to the engine.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::method::Method;
use crate::uri::Uri;

/// RFC 3261 magic cookie every compliant branch starts with.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// A name-addr as used in From/To/Contact: display name, URI, and the tag
/// parameter when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub tag: Option<String>,
}

impl Address {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Generate and attach a fresh tag if none is present, returning it.
    pub fn ensure_tag(&mut self) -> &str {
        if self.tag.is_none() {
            self.tag = Some(generate_tag());
        }
        self.tag.as_deref().unwrap()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }
        Ok(())
    }
}

/// Generate a random dialog tag (RFC 3261 section 19.3).
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

/// One Via hop: the transport token, the sent-by host:port, and the branch
/// parameter used for transaction correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    pub transport: String,
    pub sent_by: String,
    pub branch: Option<String>,
}

impl Via {
    pub fn new(transport: impl Into<String>, sent_by: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            sent_by: sent_by.into(),
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// True when the branch carries the RFC 3261 magic cookie. Branches
    /// without it belong to RFC 2543 peers and fall back to the slow
    /// legacy matching path.
    pub fn is_rfc3261_branch(&self) -> bool {
        self.branch
            .as_deref()
            .map(|b| b.starts_with(MAGIC_COOKIE))
            .unwrap_or(false)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by)?;
        if let Some(branch) = &self.branch {
            write!(f, ";branch={}", branch)?;
        }
        Ok(())
    }
}

/// Call-ID header value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CSeq header value: sequence number plus method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }

    pub fn sequence(&self) -> u32 {
        self.seq
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// RAck header value carried by a PRACK: the RSeq of the reliable
/// provisional being acknowledged plus the CSeq of the original INVITE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

impl RAck {
    pub fn new(rseq: u32, cseq: u32, method: Method) -> Self {
        Self { rseq, cseq, method }
    }

    /// Whether this RAck acknowledges the given reliable provisional.
    pub fn matches(&self, rseq: u32, cseq: &CSeq) -> bool {
        self.rseq == rseq && self.cseq == cseq.seq && self.method == cseq.method
    }
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_tag_handling() {
        let mut addr = Address::new("sip:alice@example.com".parse().unwrap());
        assert!(addr.tag().is_none());
        let tag = addr.ensure_tag().to_string();
        assert_eq!(addr.tag(), Some(tag.as_str()));
        // ensure_tag is stable once set
        assert_eq!(addr.ensure_tag(), tag);
    }

    #[test]
    fn via_branch_cookie() {
        let rfc = Via::new("UDP", "client.example.com:5060").with_branch("z9hG4bK776asdhds");
        assert!(rfc.is_rfc3261_branch());

        let legacy = Via::new("UDP", "old.example.com").with_branch("1234");
        assert!(!legacy.is_rfc3261_branch());

        let none = Via::new("UDP", "old.example.com");
        assert!(!none.is_rfc3261_branch());
    }

    #[test]
    fn rack_matching() {
        let cseq = CSeq::new(7, Method::Invite);
        let rack = RAck::new(3, 7, Method::Invite);
        assert!(rack.matches(3, &cseq));
        assert!(!rack.matches(4, &cseq));
        assert!(!rack.matches(3, &CSeq::new(8, Method::Invite)));
    }
}
