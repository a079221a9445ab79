/// WebSocket subprotocol spoken by the relay's realtime endpoint
pub const RELAY_SUBPROTOCOL: &str = "aws-appsync-event-ws";

/// Prefix of the second subprotocol that carries the signed header blob
pub const HEADER_SUBPROTOCOL_PREFIX: &str = "header-";

/// Path of the relay's HTTP endpoint used as the signing target
pub const RELAY_EVENT_PATH: &str = "/event";

/// Path of the relay's realtime endpoint
pub const RELAY_REALTIME_PATH: &str = "/event/realtime";

/// Service name used in the request signature credential scope
pub const RELAY_SIGNING_SERVICE: &str = "appsync";

/// Channel the local process subscribes to for tunneled invocations
pub const REQUEST_CHANNEL: &str = "requests";

/// Prefix of the per-invocation reply channel (`response/{request_id}`)
pub const RESPONSE_CHANNEL_PREFIX: &str = "response";

/// Default channel namespace
pub const DEFAULT_NAMESPACE: &str = "live-lambda";

/// Keep-alive interval assumed when the connection ack omits one (5 minutes)
pub const DEFAULT_KEEPALIVE_MS: u64 = 300_000;

/// Extra time allowed past the keep-alive interval before the watchdog fires
pub const KEEPALIVE_GRACE_MS: u64 = 5_000;

/// Handshake timeout (connection open through `connection_ack`)
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Time allowed for the relay to answer a graceful close
pub const CLOSE_TIMEOUT_SECS: u64 = 5;

/// Base delay for exponential backoff reconnection (2 seconds)
pub const RECONNECT_MIN_DELAY_MS: u64 = 2_000;

/// Maximum delay for exponential backoff reconnection (30 seconds)
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_MULTIPLIER: f64 = 2.0;

/// Attempts made to publish one reply before giving up
pub const REPLY_PUBLISH_ATTEMPTS: usize = 5;

/// Initial delay between reply publish attempts (1 second)
pub const REPLY_RETRY_DELAY_MS: u64 = 1_000;

/// Number of recently handled request ids remembered for de-duplication
pub const RECENT_REQUEST_CAPACITY: usize = 512;

/// Default number of invocations executed concurrently
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Export used when the declared handler points at an injected wrapper
pub const DEFAULT_HANDLER_EXPORT: &str = "handler";

/// Module used when the declared handler points at an injected wrapper
pub const DEFAULT_HANDLER_FILE: &str = "index";

/// Lifetime requested for assumed execution-role credentials (15 minutes)
pub const ASSUMED_ROLE_DURATION_SECS: i32 = 900;

/// Maximum length of an STS role session name
pub const MAX_SESSION_NAME_LENGTH: usize = 64;

/// Handler time limit when neither the context deadline nor the function
/// configuration gives one (Lambda's own maximum)
pub const DEFAULT_INVOCATION_TIMEOUT_MS: u64 = 900_000;

/// How long handler output is still read after the runtime process exits
pub const OUTPUT_DRAIN_MS: u64 = 500;
