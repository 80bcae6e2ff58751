//! The dialog value object: identity, sequencing, route set, and ACK
//! bookkeeping per RFC 3261 section 12.

use sipline_sip_core::{Address, CSeq, Method, Request, Response, Uri, Via};
use sipline_transaction_core::utils::generate_branch;
use tracing::{debug, warn};

use crate::errors::{DialogError, DialogResult};

use super::{DialogId, DialogState, EarlyDialogId};

/// One SIP dialog, either side.
///
/// A `Dialog` holds the peer-to-peer state of RFC 3261 section 12: the
/// three-way identity, both CSeq counters, the frozen route set, the
/// remote target, and the ACK bookkeeping the dialog layer needs because
/// the ACK to a 2xx lives outside any transaction.
///
/// The struct is plain data; the [`DialogManager`](crate::manager::DialogManager)
/// owns locking and drives all mutation.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    /// Tag this side contributed. For a UAS dialog it is assigned when
    /// the first tagged response goes out.
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    pub state: DialogState,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    /// Last CSeq number used for a request this side sent. Monotonic.
    pub local_cseq: u32,
    /// Highest CSeq number accepted from the peer.
    pub remote_cseq: u32,
    /// Where in-dialog requests go (peer's Contact, target-refreshed).
    pub remote_target: Uri,
    /// Route set, in traversal order for outbound requests.
    pub route_set: Vec<Uri>,
    /// The route set is computed from exactly one message and never
    /// rebuilt, even when later responses carry different Record-Route.
    route_set_frozen: bool,
    /// True when this side sent the dialog-creating request.
    pub is_initiator: bool,
    /// Serialize re-INVITEs through the ACK gate for this dialog.
    pub is_b2bua: bool,
    /// Reject peer requests whose CSeq does not strictly increase.
    cseq_validation: bool,
    /// The ACK this side last sent for a 2xx, kept for retransmission
    /// when the 2xx is retransmitted.
    pub last_ack_sent: Option<Request>,
    /// INVITE/2xx pair awaiting our ACK (initiator side).
    pending_invite_ok: Option<(Request, Response)>,
    /// Highest INVITE CSeq this side has acknowledged.
    highest_acked_cseq: u32,
    /// Whether the peer's ACK for our current 2xx has been seen
    /// (non-initiator side).
    pub ack_seen: bool,
}

impl Dialog {
    /// UAC path: build a confirmed dialog from the INVITE this side sent
    /// and the 2xx that answered it. Returns `None` when the response
    /// carries no To tag.
    pub fn from_2xx_response(request: &Request, response: &Response, is_b2bua: bool) -> Option<Self> {
        let mut dialog = Self::from_response(request, response, is_b2bua)?;
        dialog.state = DialogState::Confirmed;
        Some(dialog)
    }

    /// UAC path: build an early dialog from a tagged 1xx.
    pub fn from_provisional_response(
        request: &Request,
        response: &Response,
        is_b2bua: bool,
    ) -> Option<Self> {
        let mut dialog = Self::from_response(request, response, is_b2bua)?;
        dialog.state = DialogState::Early;
        Some(dialog)
    }

    fn from_response(request: &Request, response: &Response, is_b2bua: bool) -> Option<Self> {
        let call_id = request.call_id_str()?.to_string();
        let local_tag = request.from_tag()?.to_string();
        let remote_tag = response.to_tag()?.to_string();
        let local_uri = request.from.as_ref()?.uri.clone();
        let remote_uri = request.to.as_ref()?.uri.clone();

        // Remote target comes from the response Contact; without one the
        // request URI is the only address we have.
        let remote_target = response
            .contact
            .as_ref()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| request.uri.clone());

        // Initiator route set: Record-Route of the establishing response,
        // reversed (RFC 3261 section 12.1.2). Frozen from here on.
        let mut route_set: Vec<Uri> = response.record_route.clone();
        route_set.reverse();

        Some(Self {
            call_id,
            local_tag: Some(local_tag),
            remote_tag: Some(remote_tag),
            state: DialogState::Initial,
            local_uri,
            remote_uri,
            local_cseq: request.cseq_seq().unwrap_or(0),
            remote_cseq: 0,
            remote_target,
            route_set,
            route_set_frozen: true,
            is_initiator: true,
            is_b2bua,
            cseq_validation: true,
            last_ack_sent: None,
            pending_invite_ok: None,
            highest_acked_cseq: 0,
            ack_seen: false,
        })
    }

    /// UAS path: build a dialog from a dialog-creating request. The local
    /// tag is not fixed until this side sends a tagged response; the
    /// dialog starts `Initial`.
    pub fn from_request(request: &Request, is_b2bua: bool) -> Option<Self> {
        let call_id = request.call_id_str()?.to_string();
        let remote_tag = request.from_tag()?.to_string();
        let local_uri = request.to.as_ref()?.uri.clone();
        let remote_uri = request.from.as_ref()?.uri.clone();
        let remote_target = request
            .contact
            .as_ref()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| remote_uri.clone());

        // Recipient route set: Record-Route of the request, in the order
        // received (RFC 3261 section 12.1.1). Frozen immediately.
        let route_set = request.record_route.clone();

        Some(Self {
            call_id,
            local_tag: None,
            remote_tag: Some(remote_tag),
            state: DialogState::Initial,
            local_uri,
            remote_uri,
            local_cseq: 0,
            remote_cseq: request.cseq_seq().unwrap_or(0),
            remote_target,
            route_set,
            route_set_frozen: true,
            is_initiator: false,
            is_b2bua,
            cseq_validation: true,
            last_ack_sent: None,
            pending_invite_ok: None,
            highest_acked_cseq: 0,
            ack_seen: false,
        })
    }

    pub fn set_cseq_validation(&mut self, enabled: bool) {
        self.cseq_validation = enabled;
    }

    /// Full identity once both tags are known.
    pub fn id(&self) -> Option<DialogId> {
        match (&self.local_tag, &self.remote_tag) {
            (Some(local), Some(remote)) => {
                Some(DialogId::new(self.call_id.clone(), local.clone(), remote.clone()))
            }
            _ => None,
        }
    }

    /// Identity before the peer tag is fixed (UAC waiting for a tagged
    /// response).
    pub fn early_id(&self) -> Option<EarlyDialogId> {
        self.local_tag
            .as_ref()
            .map(|local| EarlyDialogId::new(self.call_id.clone(), local.clone()))
    }

    /// Fix this side's tag (UAS, on first tagged response).
    pub fn set_local_tag(&mut self, tag: impl Into<String>) {
        if self.local_tag.is_none() {
            self.local_tag = Some(tag.into());
        }
    }

    /// Move to `next`, returning the previous state. Illegal moves are
    /// rejected; same-state moves succeed without effect.
    pub fn transition_to(&mut self, next: DialogState) -> DialogResult<DialogState> {
        if !self.state.can_transition_to(next) {
            return Err(DialogError::invalid_state(format!(
                "dialog cannot move {} -> {}",
                self.state, next
            )));
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    /// Absorb a 2xx on the initiator side: learn the remote tag if still
    /// unset, refresh the remote target, confirm. The route set does not
    /// change; it was frozen by the first establishing message.
    pub fn update_from_2xx(&mut self, response: &Response) -> DialogResult<DialogState> {
        if self.remote_tag.is_none() {
            self.remote_tag = response.to_tag().map(str::to_string);
        }
        if let Some(contact) = &response.contact {
            self.remote_target = contact.uri.clone();
        }
        debug_assert!(self.route_set_frozen);
        self.transition_to(DialogState::Confirmed)
    }

    /// Target refresh from an in-dialog request (re-INVITE Contact).
    pub fn update_remote_target(&mut self, contact: &Address) {
        self.remote_target = contact.uri.clone();
    }

    /// Accept or reject a peer CSeq. Strictly greater advances the
    /// counter; equal or lower is a stale or replayed request unless
    /// validation is disabled.
    pub fn update_remote_sequence(&mut self, seq: u32) -> DialogResult<()> {
        if seq > self.remote_cseq {
            self.remote_cseq = seq;
            return Ok(());
        }
        if !self.cseq_validation {
            warn!(
                call_id = %self.call_id,
                seq,
                current = self.remote_cseq,
                "accepting out-of-order CSeq, validation disabled"
            );
            return Ok(());
        }
        Err(DialogError::protocol_error(format!(
            "stale CSeq {} (current {})",
            seq, self.remote_cseq
        )))
    }

    /// Reserve the next local CSeq number.
    ///
    /// Panics if the counter would decrease; that is a caller bug, not a
    /// peer behavior, and must not be absorbed silently.
    pub fn next_local_cseq(&mut self) -> u32 {
        let next = self
            .local_cseq
            .checked_add(1)
            .expect("local CSeq overflow");
        assert!(next > self.local_cseq, "local CSeq must be monotonic");
        self.local_cseq = next;
        next
    }

    /// Build an in-dialog request for `method`, assigning the CSeq and
    /// applying the route set (RFC 3261 section 12.2.1.1).
    ///
    /// ACK for a 2xx is special-cased: it reuses the INVITE's CSeq number
    /// and is built by [`create_ack`](Self::create_ack) instead.
    pub fn next_request(&mut self, method: Method) -> DialogResult<Request> {
        if self.state.is_terminated() {
            return Err(DialogError::invalid_state(format!(
                "dialog {} is terminated",
                self.call_id
            )));
        }
        if method == Method::Ack {
            return Err(DialogError::invalid_state(
                "ACK is built from the pending INVITE, not as a fresh request",
            ));
        }
        let local_tag = self.local_tag.clone().ok_or_else(|| {
            DialogError::invalid_state("cannot send in-dialog request before local tag is fixed")
        })?;

        let seq = self.next_local_cseq();
        let (uri, route) = self.request_target();

        let mut request = Request::new(method.clone(), uri)
            .with_from(Address::new(self.local_uri.clone()).with_tag(local_tag))
            .with_to(self.remote_address())
            .with_call_id(self.call_id.clone());
        request.cseq = Some(CSeq::new(seq, method));
        request.route = route;
        Ok(request)
    }

    /// Record the INVITE/2xx pair this side must ACK.
    pub fn record_invite_ok(&mut self, invite: Request, ok: Response) {
        self.pending_invite_ok = Some((invite, ok));
    }

    /// Whether a 2xx is waiting for our ACK.
    pub fn has_pending_ok(&self) -> bool {
        self.pending_invite_ok.is_some()
    }

    /// Build the ACK for the recorded 2xx (RFC 3261 section 13.2.2.4):
    /// a new transaction with a fresh branch, CSeq number copied from the
    /// INVITE, aimed through the dialog route set.
    ///
    /// Idempotent per INVITE: re-ACKing a retransmitted 2xx returns a
    /// clone of the ACK already sent.
    pub fn create_ack(&mut self, local_via: Via) -> DialogResult<Request> {
        let (invite, _ok) = match &self.pending_invite_ok {
            Some(pair) => pair.clone(),
            None => {
                if let Some(ack) = &self.last_ack_sent {
                    return Ok(ack.clone());
                }
                return Err(DialogError::invalid_state("no 2xx awaiting ACK"));
            }
        };
        let invite_cseq = invite
            .cseq_seq()
            .ok_or_else(|| DialogError::protocol_error("recorded INVITE has no CSeq"))?;
        let local_tag = self
            .local_tag
            .clone()
            .ok_or_else(|| DialogError::invalid_state("ACK before local tag is fixed"))?;

        let (uri, route) = self.request_target();
        let mut ack = Request::new(Method::Ack, uri)
            .with_via(local_via.with_branch(generate_branch()))
            .with_from(Address::new(self.local_uri.clone()).with_tag(local_tag))
            .with_to(self.remote_address())
            .with_call_id(self.call_id.clone());
        ack.cseq = Some(CSeq::new(invite_cseq, Method::Ack));
        ack.route = route;

        self.highest_acked_cseq = self.highest_acked_cseq.max(invite_cseq);
        self.last_ack_sent = Some(ack.clone());
        self.pending_invite_ok = None;
        debug!(call_id = %self.call_id, cseq = invite_cseq, "ACK built for 2xx");
        Ok(ack)
    }

    /// Whether this side has sent the ACK for the INVITE at `cseq`.
    pub fn is_ack_sent(&self, cseq: u32) -> bool {
        self.highest_acked_cseq >= cseq
    }

    /// Note the peer's ACK for our 2xx. Returns true the first time.
    pub fn receive_ack(&mut self) -> bool {
        !std::mem::replace(&mut self.ack_seen, true)
    }

    /// Arm `ack_seen` for a fresh re-INVITE cycle on the UAS side.
    pub fn expect_ack(&mut self) {
        self.ack_seen = false;
    }

    pub fn terminate(&mut self) -> DialogState {
        let previous = self.state;
        self.state = DialogState::Terminated;
        previous
    }

    fn remote_address(&self) -> Address {
        let addr = Address::new(self.remote_uri.clone());
        match &self.remote_tag {
            Some(tag) => addr.with_tag(tag.clone()),
            None => addr,
        }
    }

    /// Request URI and Route headers per the loose/strict routing rules:
    /// a loose-routing first hop keeps the remote target as the URI and
    /// carries the whole set in Route; a strict first hop becomes the URI
    /// with the remote target appended to the route.
    fn request_target(&self) -> (Uri, Vec<Uri>) {
        match self.route_set.first() {
            None => (self.remote_target.clone(), Vec::new()),
            Some(first) if first.loose_routing => {
                (self.remote_target.clone(), self.route_set.clone())
            }
            Some(first) => {
                let mut route: Vec<Uri> = self.route_set[1..].to_vec();
                route.push(self.remote_target.clone());
                (first.clone(), route)
            }
        }
    }
}
