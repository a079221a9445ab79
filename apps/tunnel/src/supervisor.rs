//! Keeps the tunnel connected and subscribed to the request channel

use crate::config::ReconnectConfig;
use crate::transport::{DataHandler, TransportEvent, TunnelTransport};
use live_lambda_common::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Exponential backoff between reconnect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current = config.min_delay;
        Self {
            config,
            current,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt; grows until the ceiling
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempt += 1;
        self.current = Duration::from_millis(
            ((self.current.as_millis() as f64 * self.config.multiplier)
                .min(self.config.max_delay.as_millis() as f64)) as u64,
        )
        .max(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.min_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// Connection supervisor: connect, subscribe, wait for the drop, back off, repeat
pub struct Supervisor {
    transport: TunnelTransport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    backoff: Backoff,
    channel: String,
    on_data: DataHandler,
}

impl Supervisor {
    pub fn new(
        transport: TunnelTransport,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        reconnect: ReconnectConfig,
        channel: impl Into<String>,
        on_data: DataHandler,
    ) -> Self {
        Self {
            transport,
            events,
            backoff: Backoff::new(reconnect),
            channel: channel.into(),
            on_data,
        }
    }

    /// Run forever. Failures are logged and retried, never returned.
    pub async fn run(mut self) {
        loop {
            match self.establish().await {
                Ok(connection) => {
                    info!(
                        "Tunnel ready on connection {}, listening on '{}'",
                        connection, self.channel
                    );
                    self.backoff.reset();
                    self.wait_for_close(connection).await;
                }
                Err(e) if e.is_transport() => {
                    warn!("Failed to establish tunnel: {}", e);
                }
                Err(e) => {
                    error!("Failed to establish tunnel: {}", e);
                }
            }

            let delay = self.backoff.next_delay();
            info!(
                "Reconnecting in {:?} (attempt {})",
                delay,
                self.backoff.attempt()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Connect and subscribe; returns the connection the subscription
    /// actually landed on, which may be newer than the one first connected
    async fn establish(&mut self) -> Result<u64> {
        self.transport.connect().await?;
        let subscription = self
            .transport
            .subscribe(&self.channel, self.on_data.clone())
            .await?;
        debug!(
            "Subscribed to '{}' as {} on connection {}",
            self.channel, subscription.id, subscription.connection
        );

        Ok(subscription.connection)
    }

    /// Block until the given connection is reported closed. Events of
    /// earlier connections are stale and skipped.
    async fn wait_for_close(&mut self, connection: u64) {
        while let Some(event) = self.events.recv().await {
            match event {
                TransportEvent::Closed {
                    connection: closed,
                    code,
                    reason,
                } if closed == connection => {
                    warn!(
                        "Connection {} closed (code: {:?}, reason: '{}')",
                        closed, code, reason
                    );
                    return;
                }
                TransportEvent::Closed {
                    connection: stale, ..
                } => {
                    debug!("Ignoring close of stale connection {}", stale);
                }
                TransportEvent::Error {
                    connection: errored,
                    message,
                } => {
                    warn!("Connection {} reported: {}", errored, message);
                }
            }
        }
    }
}
