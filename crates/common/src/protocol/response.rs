use serde_json::{Value, json};

use crate::error::Result;

/// Serialize a reply into the events array published on the reply channel.
///
/// Events travel as pre-serialized JSON strings nested inside the publish
/// envelope, so a reply is always a single-element array of one string.
pub fn encode_reply(reply: &Value) -> Result<Vec<String>> {
    Ok(vec![serde_json::to_string(reply)?])
}

/// JSON body describing a failed invocation, in Lambda's error shape
pub fn error_body(error_type: &str, message: &str, trace: &[String]) -> Value {
    let mut body = json!({
        "errorType": error_type,
        "errorMessage": message,
    });
    if !trace.is_empty() {
        body["trace"] = json!(trace);
    }
    body
}

/// HTTP-shaped error reply whose body is the serialized [`error_body`]
pub fn error_response(status_code: u16, error_type: &str, message: &str, trace: &[String]) -> Value {
    json!({
        "statusCode": status_code,
        "headers": {"content-type": "application/json"},
        "body": error_body(error_type, message, trace).to_string(),
    })
}
