mod encoding;
mod id;
mod time;

pub use encoding::{decode_header_blob, encode_header_blob, header_subprotocol};
pub use id::{generate_correlation_id, generate_session_name};
pub use time::current_timestamp_millis;
