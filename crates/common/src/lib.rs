//! Common types for the live-lambda tunnel
//!
//! This crate provides the relay wire protocol, the invocation request/reply
//! shapes, request signing and small utilities shared by the tunnel client.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod signer;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use error::{Result, TunnelError};
pub use protocol::{
    Authorization, InvocationContext, InvocationRequest, PublishAck, RelayError, RelayMessage,
    encode_reply, error_response, reply_channel,
};
pub use signer::{Credentials, SigningRequest, sign};
pub use utils::{
    current_timestamp_millis, encode_header_blob, generate_correlation_id, generate_session_name,
    header_subprotocol,
};
