//! Parsed SIP message value objects.
//!
//! This crate defines the message model the sipline transaction and dialog
//! engine operates on: methods, status codes, URIs, the typed header values
//! the engine inspects (Via, From, To, Call-ID, CSeq, Contact, Record-Route,
//! RSeq/RAck), and the `Request`/`Response`/`Message` aggregates.
//!
//! Byte-level parsing and header grammar are deliberately out of scope.
//! A transport collaborator is expected to hand the engine already-parsed
//! messages; these types are the contract for that hand-off, and they carry
//! enough constructors that the engine and its tests can fabricate messages
//! directly.

pub mod headers;
pub mod method;
pub mod msg;
pub mod status;
pub mod uri;

pub use headers::{generate_tag, Address, CSeq, CallId, RAck, Via, MAGIC_COOKIE};
pub use method::Method;
pub use msg::{Message, Request, Response, SIP_VERSION};
pub use status::StatusCode;
pub use uri::Uri;

/// Common imports for consumers of the message model.
pub mod prelude {
    pub use crate::headers::{Address, CSeq, CallId, RAck, Via};
    pub use crate::method::Method;
    pub use crate::msg::{Message, Request, Response};
    pub use crate::status::StatusCode;
    pub use crate::uri::Uri;
}
