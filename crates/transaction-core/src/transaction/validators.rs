//! Ingress validation.
//!
//! Every inbound message passes through [`validate_message`] before any
//! table lookup. Rejections are values, not panics: the registry answers
//! requests with the mapped status code on a best-effort basis and drops
//! malformed responses silently (there is nobody to answer).

use sipline_sip_core::{Message, Request, SIP_VERSION};

use crate::error::RejectReason;

/// Validate an inbound message against the engine's admission rules.
pub fn validate_message(
    message: &Message,
    max_body_size: usize,
) -> Result<(), RejectReason> {
    if let Some(name) = message.missing_mandatory_header() {
        return Err(RejectReason::MissingHeader(name));
    }

    let size = message.body_len();
    if size > max_body_size {
        return Err(RejectReason::MessageTooLarge {
            size,
            limit: max_body_size,
        });
    }

    if let Message::Request(request) = message {
        validate_cseq_method(request)?;
        if request.version != SIP_VERSION {
            return Err(RejectReason::UnsupportedVersion);
        }
    }

    Ok(())
}

/// The CSeq method must agree with the request line. ACK and CANCEL reuse
/// the INVITE's sequence *number* but still carry their own method.
fn validate_cseq_method(request: &Request) -> Result<(), RejectReason> {
    let cseq = match &request.cseq {
        Some(c) => c,
        // Absence is caught by the mandatory-header check.
        None => return Ok(()),
    };
    if cseq.method != request.method {
        return Err(RejectReason::CSeqMethodMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipline_sip_core::{Address, CSeq, Method, Via};

    fn request() -> Request {
        Request::new(Method::Invite, "sip:bob@example.net".parse().unwrap())
            .with_via(Via::new("UDP", "host:5060").with_branch("z9hG4bK1"))
            .with_from(Address::new("sip:alice@example.com".parse().unwrap()).with_tag("ft"))
            .with_to(Address::new("sip:bob@example.net".parse().unwrap()))
            .with_call_id("c1")
            .with_cseq(1)
    }

    #[test]
    fn accepts_complete_request() {
        assert!(validate_message(&request().into(), 65_536).is_ok());
    }

    #[test]
    fn rejects_missing_header() {
        let mut r = request();
        r.cseq = None;
        assert_eq!(
            validate_message(&r.into(), 65_536),
            Err(RejectReason::MissingHeader("CSeq"))
        );
    }

    #[test]
    fn rejects_oversized_body() {
        let r = request().with_body(vec![0u8; 100]);
        assert_eq!(
            validate_message(&r.into(), 64),
            Err(RejectReason::MessageTooLarge { size: 100, limit: 64 })
        );
    }

    #[test]
    fn rejects_unsupported_version() {
        let r = request().with_version("SIP/1.0");
        assert_eq!(
            validate_message(&r.into(), 65_536),
            Err(RejectReason::UnsupportedVersion)
        );
    }

    #[test]
    fn rejects_cseq_method_mismatch() {
        let mut r = request();
        r.cseq = Some(CSeq::new(1, Method::Options));
        assert_eq!(
            validate_message(&r.into(), 65_536),
            Err(RejectReason::CSeqMethodMismatch)
        );
    }
}
