use clap::Parser;
use live_lambda_common::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_KEEPALIVE_MS, DEFAULT_MAX_CONCURRENCY, DEFAULT_NAMESPACE,
    KEEPALIVE_GRACE_MS, RECONNECT_MAX_DELAY_MS, RECONNECT_MIN_DELAY_MS, RECONNECT_MULTIPLIER,
    RELAY_REALTIME_PATH,
};
use live_lambda_common::validation::validate_namespace;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// CLI arguments for the local tunnel process
#[derive(Parser, Debug)]
#[command(name = "live-lambda")]
#[command(about = "Serve deployed Lambda invocations from local code", long_about = None)]
#[command(version)]
pub struct Args {
    /// Relay HTTP host, e.g. abc.appsync-api.us-east-1.amazonaws.com
    #[arg(long, env = "LIVE_LAMBDA_API_HOST")]
    pub api_host: String,

    /// Relay realtime endpoint (derived from the API host when omitted)
    #[arg(long, env = "LIVE_LAMBDA_REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// AWS region of the relay (defaults to the SDK's resolved region)
    #[arg(long, env = "LIVE_LAMBDA_REGION")]
    pub region: Option<String>,

    /// Channel namespace shared with the deployed stand-ins
    #[arg(long, env = "LIVE_LAMBDA_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Build manifest produced by the deployment
    #[arg(
        short,
        long,
        env = "LIVE_LAMBDA_MANIFEST",
        default_value = "cdk.out/outputs.json"
    )]
    pub manifest: PathBuf,

    /// Command used to run handler code
    #[arg(long, env = "LIVE_LAMBDA_RUNTIME", default_value = "node")]
    pub runtime: String,

    /// Command used to compile handler sources on demand
    #[arg(long, env = "LIVE_LAMBDA_BUNDLER", default_value = "esbuild")]
    pub bundler: String,

    /// Maximum number of invocations executed at the same time
    #[arg(long, env = "LIVE_LAMBDA_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,

    /// Connection timeout in seconds
    #[arg(long, env = "LIVE_LAMBDA_CONNECT_TIMEOUT", default_value_t = CONNECT_TIMEOUT_SECS)]
    pub connect_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long, env = "LIVE_LAMBDA_VERBOSE")]
    pub verbose: bool,
}

/// Relay connection settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host signed into every request (`host` header)
    pub api_host: String,

    /// WebSocket endpoint
    pub realtime_url: String,

    /// Region used in the signature scope
    pub region: String,

    /// Channel namespace, channels are `/{namespace}/{channel}`
    pub namespace: String,

    /// Handshake timeout
    pub connect_timeout: Duration,

    /// Keep-alive interval used when the ack does not advertise one
    pub default_keepalive: Duration,

    /// Slack added to the keep-alive interval before the watchdog fires
    pub keepalive_grace: Duration,
}

impl RelayConfig {
    /// Fully qualified relay channel for a logical channel name
    pub fn qualify(&self, channel: &str) -> String {
        format!("/{}/{}", self.namespace, channel.trim_start_matches('/'))
    }
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
            max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
            multiplier: RECONNECT_MULTIPLIER,
        }
    }
}

/// Local execution settings
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub manifest_path: PathBuf,
    /// Region exported to handlers when the invocation context has none
    pub region: String,
    pub runtime: String,
    pub bundler: String,
    pub build_dir: PathBuf,
    pub max_concurrency: usize,
}

/// Configuration for the tunnel process
#[derive(Debug, Clone)]
pub struct Config {
    pub relay: RelayConfig,
    pub reconnect: ReconnectConfig,
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Build the configuration; `fallback_region` is the SDK's resolved region
    pub fn from_args(args: Args, fallback_region: Option<String>) -> anyhow::Result<Self> {
        validate_namespace(&args.namespace)?;

        let region = args
            .region
            .or(fallback_region)
            .or_else(|| region_from_host(&args.api_host))
            .ok_or_else(|| anyhow::anyhow!("No AWS region configured for the relay"))?;

        let realtime_url = match args.realtime_url {
            Some(url) => url,
            None => derive_realtime_url(&args.api_host)?,
        };

        Ok(Self {
            relay: RelayConfig {
                api_host: args.api_host,
                realtime_url,
                region: region.clone(),
                namespace: args.namespace,
                connect_timeout: Duration::from_secs(args.connect_timeout),
                default_keepalive: Duration::from_millis(DEFAULT_KEEPALIVE_MS),
                keepalive_grace: Duration::from_millis(KEEPALIVE_GRACE_MS),
            },
            reconnect: ReconnectConfig::default(),
            sandbox: SandboxConfig {
                manifest_path: args.manifest,
                region,
                runtime: args.runtime,
                bundler: args.bundler,
                build_dir: std::env::temp_dir().join("live-lambda"),
                max_concurrency: args.max_concurrency.max(1),
            },
        })
    }
}

/// `abc.appsync-api.us-east-1.amazonaws.com` ->
/// `wss://abc.appsync-realtime-api.us-east-1.amazonaws.com/event/realtime`
pub fn derive_realtime_url(api_host: &str) -> anyhow::Result<String> {
    let realtime_host = api_host.replacen("appsync-api", "appsync-realtime-api", 1);
    let url = Url::parse(&format!("wss://{}{}", realtime_host, RELAY_REALTIME_PATH))?;
    Ok(url.to_string())
}

/// Region embedded in a relay host name, when it follows the AWS pattern
fn region_from_host(api_host: &str) -> Option<String> {
    let parts: Vec<&str> = api_host.split('.').collect();
    match parts.as_slice() {
        [_, "appsync-api", region, "amazonaws", "com"] => Some(region.to_string()),
        _ => None,
    }
}
