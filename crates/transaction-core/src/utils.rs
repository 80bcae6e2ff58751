//! Message construction helpers shared by the state machines.

use sipline_sip_core::{Method, Request, Response, MAGIC_COOKIE};
use uuid::Uuid;

/// Generate a fresh RFC 3261 branch parameter.
pub fn generate_branch() -> String {
    format!("{}{}", MAGIC_COOKIE, Uuid::new_v4().simple())
}

/// Build the ACK for a non-2xx final response, RFC 3261 section 17.1.1.3.
///
/// This ACK belongs to the INVITE transaction itself: same Request-URI,
/// same top Via (same branch), same Call-ID and From, the To copied from
/// the response (it carries the tag the UAS chose), and the INVITE's CSeq
/// number with the method set to ACK. The ACK to a 2xx is a different
/// animal built by the dialog layer.
pub fn create_ack_from_invite(invite: &Request, response: &Response) -> Request {
    let mut ack = Request::new(Method::Ack, invite.uri.clone());
    if let Some(via) = invite.top_via() {
        ack = ack.with_via(via.clone());
    }
    ack.from = invite.from.clone();
    ack.to = response.to.clone();
    ack.call_id = invite.call_id.clone();
    if let Some(cseq) = &invite.cseq {
        ack.cseq = Some(sipline_sip_core::CSeq::new(cseq.seq, Method::Ack));
    }
    ack.route = invite.route.clone();
    ack.max_forwards = invite.max_forwards;
    ack
}

/// Build the CANCEL for a pending INVITE, RFC 3261 section 9.1: identical
/// Request-URI, Call-ID, From, To, and top Via (same branch); CSeq keeps
/// the INVITE's number with the method set to CANCEL.
pub fn create_cancel_from_invite(invite: &Request) -> Request {
    let mut cancel = Request::new(Method::Cancel, invite.uri.clone());
    if let Some(via) = invite.top_via() {
        cancel = cancel.with_via(via.clone());
    }
    cancel.from = invite.from.clone();
    cancel.to = invite.to.clone();
    cancel.call_id = invite.call_id.clone();
    if let Some(cseq) = &invite.cseq {
        cancel.cseq = Some(sipline_sip_core::CSeq::new(cseq.seq, Method::Cancel));
    }
    cancel.route = invite.route.clone();
    cancel.max_forwards = invite.max_forwards;
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipline_sip_core::{Address, StatusCode, Via};

    fn invite() -> Request {
        Request::new(Method::Invite, "sip:bob@example.net".parse().unwrap())
            .with_via(Via::new("UDP", "pc.example.com:5060").with_branch("z9hG4bKinv"))
            .with_from(Address::new("sip:alice@example.com".parse().unwrap()).with_tag("ft"))
            .with_to(Address::new("sip:bob@example.net".parse().unwrap()))
            .with_call_id("c1")
            .with_cseq(9)
    }

    #[test]
    fn branch_carries_magic_cookie() {
        let a = generate_branch();
        let b = generate_branch();
        assert!(a.starts_with(MAGIC_COOKIE));
        assert_ne!(a, b);
    }

    #[test]
    fn ack_mirrors_invite_and_response_to_tag() {
        let invite = invite();
        let response =
            Response::for_request(StatusCode::BUSY_HERE, &invite).with_to_tag("uas-tag");
        let ack = create_ack_from_invite(&invite, &response);

        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.branch(), Some("z9hG4bKinv"));
        assert_eq!(ack.to_tag(), Some("uas-tag"));
        assert_eq!(ack.cseq.as_ref().unwrap().seq, 9);
        assert_eq!(ack.cseq.as_ref().unwrap().method, Method::Ack);
    }

    #[test]
    fn cancel_keeps_invite_identity() {
        let invite = invite();
        let cancel = create_cancel_from_invite(&invite);
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.branch(), invite.branch());
        assert_eq!(cancel.cseq.as_ref().unwrap().seq, 9);
        assert_eq!(cancel.cseq.as_ref().unwrap().method, Method::Cancel);
        assert_eq!(cancel.to_tag(), None);
    }
}
