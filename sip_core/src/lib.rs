//! Minimal SIP user agent: message formatting and parsing, per-call dialog
//! state, a transport abstraction and the call controller that drives one
//! REGISTER plus one call over it.

use thiserror::Error;

pub mod builder;
pub mod call;
pub mod dialog;
pub mod extract;
pub mod message;
pub mod registration;
pub mod transport;

pub use builder::{
    build_ack, build_bye, build_invite, build_invite_with_headers, build_register, name_addr,
    ResponseBuilder,
};
pub use call::{CallConfig, CallController, CallError, CallOutcome, CallState, Hangup, Mode, Stage};
pub use dialog::{DialogContext, LocalIdentity, Role};
pub use extract::{
    extract_call_id, extract_caller_number, extract_contact, extract_cseq, extract_identity,
    extract_record_route, extract_request_target, extract_sdp, extract_tag, extract_via_headers,
};
pub use message::{
    bracket_host, parse_message, split_host_port, CSeq, Header, Headers, Message, Method,
    Request, Response, Uri,
};
pub use transport::{Transport, TransportError, TransportKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SipError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid URI: {0}")]
    InvalidUri(String),
}

pub type Result<T> = std::result::Result<T, SipError>;
