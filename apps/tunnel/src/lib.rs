//! Serve deployed Lambda invocations from local code
//!
//! A deployed stand-in publishes each invocation on the relay's `requests`
//! channel. This crate keeps a signed, supervised subscription to that
//! channel, runs the matching local handler with the function's own
//! execution role and publishes the result on `response/{request_id}`.

pub mod aws;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod manifest;
pub mod sandbox;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{Args, Config};
pub use dispatcher::{Dispatcher, Executor, ReplyPublisher};
pub use error::InvocationError;
pub use manifest::{ManifestResolver, ResolvedFunction};
pub use sandbox::{EnvironmentSnapshot, Sandbox};
pub use supervisor::{Backoff, Supervisor};
pub use transport::{ConnectionState, Subscription, TransportEvent, TunnelTransport};
