//! Request, response, and message aggregates.
//!
//! These are the "parsed SIP message" value objects handed to the engine by
//! the transport collaborator. Mandatory-header completeness is *not*
//! enforced at construction: the engine's ingress validates it and rejects
//! incomplete messages explicitly, so the fields the engine requires are
//! optional here.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::headers::{Address, CSeq, CallId, RAck, Via};
use crate::method::Method;
use crate::status::StatusCode;
use crate::uri::Uri;

/// The only protocol version this engine speaks.
pub const SIP_VERSION: &str = "SIP/2.0";

/// A parsed SIP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    /// Version token from the request line. Anything but SIP/2.0 is
    /// rejected at ingress with 505.
    pub version: String,
    /// Via chain, topmost first. The top branch identifies the transaction.
    pub via: Vec<Via>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub call_id: Option<CallId>,
    pub cseq: Option<CSeq>,
    pub contact: Option<Address>,
    /// Route set to traverse, in traversal order.
    pub route: Vec<Uri>,
    pub record_route: Vec<Uri>,
    pub max_forwards: Option<u32>,
    /// Present on PRACK only.
    pub rack: Option<RAck>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: SIP_VERSION.to_string(),
            via: Vec::new(),
            from: None,
            to: None,
            call_id: None,
            cseq: None,
            contact: None,
            route: Vec::new(),
            record_route: Vec::new(),
            max_forwards: Some(70),
            rack: None,
            body: Vec::new(),
        }
    }

    pub fn with_via(mut self, via: Via) -> Self {
        self.via.insert(0, via);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(CallId::new(call_id));
        self
    }

    pub fn with_cseq(mut self, seq: u32) -> Self {
        self.cseq = Some(CSeq::new(seq, self.method.clone()));
        self
    }

    pub fn with_contact(mut self, contact: Address) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_rack(mut self, rack: RAck) -> Self {
        self.rack = Some(rack);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Branch parameter of the topmost Via, when present.
    pub fn branch(&self) -> Option<&str> {
        self.via.first().and_then(|v| v.branch())
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.as_ref().and_then(|a| a.tag())
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.as_ref().and_then(|a| a.tag())
    }

    pub fn call_id_str(&self) -> Option<&str> {
        self.call_id.as_ref().map(|c| c.as_str())
    }

    pub fn cseq_seq(&self) -> Option<u32> {
        self.cseq.as_ref().map(|c| c.seq)
    }

    /// First missing mandatory header, if any (From/To/Call-ID/CSeq/Via).
    pub fn missing_mandatory_header(&self) -> Option<&'static str> {
        if self.via.is_empty() {
            Some("Via")
        } else if self.from.is_none() {
            Some("From")
        } else if self.to.is_none() {
            Some("To")
        } else if self.call_id.is_none() {
            Some("Call-ID")
        } else if self.cseq.is_none() {
            Some("CSeq")
        } else {
            None
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.uri, self.version)
    }
}

/// A parsed SIP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub via: Vec<Via>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub call_id: Option<CallId>,
    pub cseq: Option<CSeq>,
    pub contact: Option<Address>,
    pub record_route: Vec<Uri>,
    /// Present on reliable provisional responses (RFC 3262).
    pub rseq: Option<u32>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status.canonical_reason().to_string(),
            via: Vec::new(),
            from: None,
            to: None,
            call_id: None,
            cseq: None,
            contact: None,
            record_route: Vec::new(),
            rseq: None,
            body: Vec::new(),
        }
    }

    /// Build a response to `request`, copying the headers a UAS must echo
    /// (Via chain, From, To, Call-ID, CSeq) per RFC 3261 section 8.2.6.2.
    pub fn for_request(status: StatusCode, request: &Request) -> Self {
        let mut response = Self::new(status);
        response.via = request.via.clone();
        response.from = request.from.clone();
        response.to = request.to.clone();
        response.call_id = request.call_id.clone();
        response.cseq = request.cseq.clone();
        response
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        if let Some(to) = self.to.take() {
            self.to = Some(to.with_tag(tag));
        }
        self
    }

    pub fn with_contact(mut self, contact: Address) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_record_route(mut self, routes: Vec<Uri>) -> Self {
        self.record_route = routes;
        self
    }

    pub fn with_rseq(mut self, rseq: u32) -> Self {
        self.rseq = Some(rseq);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.via.first().and_then(|v| v.branch())
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.as_ref().and_then(|a| a.tag())
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.as_ref().and_then(|a| a.tag())
    }

    pub fn call_id_str(&self) -> Option<&str> {
        self.call_id.as_ref().map(|c| c.as_str())
    }

    pub fn cseq_method(&self) -> Option<&Method> {
        self.cseq.as_ref().map(|c| &c.method)
    }

    pub fn missing_mandatory_header(&self) -> Option<&'static str> {
        if self.via.is_empty() {
            Some("Via")
        } else if self.from.is_none() {
            Some("From")
        } else if self.to.is_none() {
            Some("To")
        } else if self.call_id.is_none() {
            Some("Call-ID")
        } else if self.cseq.is_none() {
            Some("CSeq")
        } else {
            None
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}", self.status, self.reason)
    }
}

/// Either a request or a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Request(_) => None,
            Message::Response(r) => Some(r),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Message::Request(r) => r.branch(),
            Message::Response(r) => r.branch(),
        }
    }

    pub fn call_id_str(&self) -> Option<&str> {
        match self {
            Message::Request(r) => r.call_id_str(),
            Message::Response(r) => r.call_id_str(),
        }
    }

    pub fn body_len(&self) -> usize {
        match self {
            Message::Request(r) => r.body.len(),
            Message::Response(r) => r.body.len(),
        }
    }

    pub fn missing_mandatory_header(&self) -> Option<&'static str> {
        match self {
            Message::Request(r) => r.missing_mandatory_header(),
            Message::Response(r) => r.missing_mandatory_header(),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => r.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Request {
        Request::new(Method::Invite, "sip:bob@example.net".parse().unwrap())
            .with_via(Via::new("UDP", "client.example.com:5060").with_branch("z9hG4bK-test"))
            .with_from(Address::new("sip:alice@example.com".parse().unwrap()).with_tag("a1"))
            .with_to(Address::new("sip:bob@example.net".parse().unwrap()))
            .with_call_id("call-1")
            .with_cseq(1)
    }

    #[test]
    fn mandatory_headers_check() {
        let complete = invite();
        assert!(complete.missing_mandatory_header().is_none());

        let mut missing = invite();
        missing.call_id = None;
        assert_eq!(missing.missing_mandatory_header(), Some("Call-ID"));

        let bare = Request::new(Method::Invite, "sip:bob@example.net".parse().unwrap());
        assert_eq!(bare.missing_mandatory_header(), Some("Via"));
    }

    #[test]
    fn response_for_request_echoes_headers() {
        let request = invite();
        let response = Response::for_request(StatusCode::RINGING, &request).with_to_tag("b1");

        assert_eq!(response.branch(), Some("z9hG4bK-test"));
        assert_eq!(response.from_tag(), Some("a1"));
        assert_eq!(response.to_tag(), Some("b1"));
        assert_eq!(response.call_id_str(), Some("call-1"));
        assert_eq!(response.cseq_method(), Some(&Method::Invite));
        assert_eq!(response.reason, "Ringing");
    }

    #[test]
    fn message_accessors() {
        let msg: Message = invite().into();
        assert!(msg.is_request());
        assert_eq!(msg.branch(), Some("z9hG4bK-test"));
        assert_eq!(msg.call_id_str(), Some("call-1"));
    }
}
