use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use clap::Parser;
use live_lambda::aws::{LambdaFunctionConfigs, StsRoleAssumer};
use live_lambda::credentials::SdkCredentials;
use live_lambda::{
    Args, Config, Dispatcher, EnvironmentSnapshot, Sandbox, Supervisor, TunnelTransport,
};
use live_lambda_common::constants::REQUEST_CHANNEL;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Captured before anything else can touch the environment
    let snapshot = EnvironmentSnapshot::capture();

    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Live Lambda v{}", env!("CARGO_PKG_VERSION"));

    let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let config = Config::from_args(args, sdk_config.region().map(|r| r.to_string()))?;
    info!("Relay: {}", config.relay.realtime_url);
    info!("Namespace: {}", config.relay.namespace);
    info!("Manifest: {}", config.sandbox.manifest_path.display());

    let provider = sdk_config
        .credentials_provider()
        .context("No AWS credentials configured")?;
    let (transport, events) =
        TunnelTransport::new(config.relay.clone(), Arc::new(SdkCredentials::new(provider)));

    let sandbox = Sandbox::new(
        &config.sandbox,
        snapshot,
        Arc::new(LambdaFunctionConfigs::new(&sdk_config)),
        Arc::new(StsRoleAssumer::new(&sdk_config)),
    );
    let dispatcher = Dispatcher::new(
        Arc::new(sandbox),
        Arc::new(transport.clone()),
        config.sandbox.max_concurrency,
    );
    let supervisor = Supervisor::new(
        transport.clone(),
        events,
        config.reconnect.clone(),
        REQUEST_CHANNEL,
        dispatcher.data_handler(),
    );

    // Run until interrupted
    tokio::select! {
        _ = supervisor.run() => {
            error!("Supervisor exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }

    if let Err(e) = transport.disconnect().await {
        error!("Failed to close relay connection: {}", e);
    }
    Ok(())
}
