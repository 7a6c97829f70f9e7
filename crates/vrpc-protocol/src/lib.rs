//! Wire protocol shared by the `vrpc` host client and the `vrpcd` guest agent.
//!
//! The crate is transport agnostic. It defines the closed fault taxonomy
//! ([`ErrorKind`], [`RpcFault`]), the HTTP-like message codec
//! ([`encode_request`], [`decode_request`], [`encode_response`],
//! [`decode_response`]), and the `{code, message, timestamp, data?}`
//! [`Envelope`] carried in every response body. Request paths live in
//! [`routes`].

pub mod codec;
pub mod digest;
pub mod envelope;
pub mod errors;
pub mod headers;
pub mod routes;

pub use codec::{
    DEFAULT_HOST, DecodeError, EncodeError, HEADER_TERMINATOR, JSON_CONTENT_TYPE,
    PROTOCOL_VERSION, Request, Response, decode_request, decode_response, encode_request,
    encode_response, find_header_end,
};
pub use digest::sha256_hex;
pub use envelope::{Envelope, unix_timestamp};
pub use errors::{ErrorKind, RpcFault, SUCCESS_CODE, SUCCESS_MESSAGE, TransportStatus};
pub use headers::Headers;
