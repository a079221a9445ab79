use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};

use crate::constants::HEADER_SUBPROTOCOL_PREFIX;
use crate::error::Result;
use crate::protocol::Authorization;

/// Encode signed handshake headers as URL-safe base64 JSON
pub fn encode_header_blob(headers: &Authorization) -> Result<String> {
    let json = serde_json::to_string(headers)?;
    Ok(URL_SAFE_NO_PAD.encode(json.as_bytes()))
}

/// Decode a header blob produced by [`encode_header_blob`]
pub fn decode_header_blob(blob: &str) -> Result<Authorization> {
    let bytes = URL_SAFE_NO_PAD.decode(blob.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Subprotocol token carrying the header blob: `header-{blob}`
pub fn header_subprotocol(headers: &Authorization) -> Result<String> {
    Ok(format!(
        "{}{}",
        HEADER_SUBPROTOCOL_PREFIX,
        encode_header_blob(headers)?
    ))
}
