//! Transaction identification.
//!
//! RFC 3261 sections 17.1.3 and 17.2.3: the branch parameter of the top Via
//! identifies the transaction, combined with the method (because CANCEL
//! shares the INVITE's branch but is its own transaction) and the
//! client/server side. Requests from RFC 2543 peers carry no magic-cookie
//! branch; for those a deterministic legacy key is computed from the dialog
//! identifiers so retransmissions still match.

use std::fmt;

use sipline_sip_core::{Method, Request, Response};

/// Unique identifier of a transaction within one registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    /// Branch of the top Via (or computed legacy id).
    pub branch: String,
    /// Method of the initiating request. ACK to a non-2xx matches the
    /// INVITE key, so ACK never appears here on the server side.
    pub method: Method,
    /// Server or client side; a UA acting as both must not collide.
    pub is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server,
        }
    }

    /// Server-side key for an inbound request. ACK is mapped onto the
    /// INVITE transaction it acknowledges; CANCEL keeps its own method so
    /// it forms a distinct transaction with the same branch.
    pub fn from_request(request: &Request) -> Option<Self> {
        let branch = match request.branch() {
            Some(b) if !b.is_empty() => b.to_string(),
            _ => legacy_branch(request)?,
        };
        let method = match request.method {
            Method::Ack => Method::Invite,
            ref m => m.clone(),
        };
        Some(Self::new(branch, method, true))
    }

    /// Client-side key for an inbound response: top Via branch plus the
    /// CSeq method (the branch alone is ambiguous between INVITE and its
    /// CANCEL).
    pub fn from_response(response: &Response) -> Option<Self> {
        let branch = response.branch().filter(|b| !b.is_empty())?.to_string();
        let method = response.cseq_method()?.clone();
        Some(Self::new(branch, method, false))
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Same branch and side, different method. Used to find the INVITE a
    /// CANCEL targets.
    pub fn with_method(&self, method: Method) -> Self {
        Self {
            branch: self.branch.clone(),
            method,
            is_server: self.is_server,
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.is_server { "server" } else { "client" };
        write!(f, "{}:{}:{}", self.branch, self.method, side)
    }
}

/// Deterministic key for branch-less (RFC 2543) requests, derived from the
/// fields such peers keep stable across retransmissions. This is the slow
/// legacy path; it exists only so old peers' retransmissions coalesce.
fn legacy_branch(request: &Request) -> Option<String> {
    let call_id = request.call_id_str()?;
    let cseq = request.cseq_seq()?;
    let from_tag = request.from_tag().unwrap_or("");
    let via = request.top_via()?;
    Some(format!(
        "legacy-{}-{}-{}-{}",
        call_id, cseq, from_tag, via.sent_by
    ))
}

/// Key for merged-request (loop) detection, RFC 3261 section 8.2.2.2.
///
/// A request without a To tag that matches an ongoing transaction on
/// (From tag, Call-ID, CSeq) but fails normal transaction matching has
/// arrived via more than one path and must be answered 482.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeId {
    pub from_tag: String,
    pub call_id: String,
    /// The full CSeq: sequence number and method. A CANCEL shares its
    /// INVITE's number but differs in method, so it never merges with it.
    pub cseq: u32,
    pub cseq_method: Method,
}

impl MergeId {
    /// Compute the merge key for a request. Only untagged (dialog-forming)
    /// requests participate in merge detection.
    pub fn from_request(request: &Request) -> Option<Self> {
        if request.to_tag().is_some() {
            return None;
        }
        let cseq = request.cseq.as_ref()?;
        Some(Self {
            from_tag: request.from_tag()?.to_string(),
            call_id: request.call_id_str()?.to_string(),
            cseq: cseq.seq,
            cseq_method: cseq.method.clone(),
        })
    }
}

impl fmt::Display for MergeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} {}",
            self.from_tag, self.call_id, self.cseq, self.cseq_method
        )
    }
}
