mod message;
mod request;
mod response;

pub use message::{Authorization, PublishAck, RelayError, RelayMessage};
pub use request::{InvocationContext, InvocationRequest, function_name_from_arn, reply_channel};
pub use response::{encode_reply, error_body, error_response};
