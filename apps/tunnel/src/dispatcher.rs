//! Turns request-channel data into executions and executions into replies

use crate::transport::{DataHandler, TunnelTransport};
use async_trait::async_trait;
use live_lambda_common::constants::{
    RECENT_REQUEST_CAPACITY, REPLY_PUBLISH_ATTEMPTS, REPLY_RETRY_DELAY_MS,
};
use live_lambda_common::validation::validate_request_id;
use live_lambda_common::{
    InvocationRequest, PublishAck, Result, TunnelError, encode_reply, reply_channel,
};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Runs an invocation and always yields a reply value
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &InvocationRequest) -> Value;
}

/// Where replies are published
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    async fn publish(&self, channel: &str, events: Vec<String>) -> Result<PublishAck>;
}

#[async_trait]
impl ReplyPublisher for TunnelTransport {
    async fn publish(&self, channel: &str, events: Vec<String>) -> Result<PublishAck> {
        TunnelTransport::publish(self, channel, events).await
    }
}

/// Reply publish retry policy
#[derive(Debug, Clone)]
pub struct ReplyRetry {
    pub attempts: usize,
    pub initial_delay: Duration,
}

impl Default for ReplyRetry {
    fn default() -> Self {
        Self {
            attempts: REPLY_PUBLISH_ATTEMPTS,
            initial_delay: Duration::from_millis(REPLY_RETRY_DELAY_MS),
        }
    }
}

/// Bounded memory of request ids already accepted
#[derive(Debug)]
struct RecentRequests {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentRequests {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// `false` when the id was already seen
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    publisher: Arc<dyn ReplyPublisher>,
    permits: Arc<Semaphore>,
    recent: Arc<Mutex<RecentRequests>>,
    retry: ReplyRetry,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn Executor>,
        publisher: Arc<dyn ReplyPublisher>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            executor,
            publisher,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            recent: Arc::new(Mutex::new(RecentRequests::new(RECENT_REQUEST_CAPACITY))),
            retry: ReplyRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ReplyRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Continuation for the request-channel subscription
    pub fn data_handler(&self) -> DataHandler {
        let dispatcher = self.clone();
        Arc::new(move |payload| {
            dispatcher.dispatch(payload);
        })
    }

    /// Accept one request-channel payload. Malformed and duplicate messages
    /// are dropped; everything else is executed on its own task.
    pub fn dispatch(&self, payload: String) -> Option<JoinHandle<()>> {
        let request = match parse_request(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping request message: {}", e);
                return None;
            }
        };

        let fresh = match self.recent.lock() {
            Ok(mut recent) => recent.insert(&request.request_id),
            Err(poisoned) => poisoned.into_inner().insert(&request.request_id),
        };
        if !fresh {
            info!("Ignoring duplicate delivery of {}", request.request_id);
            return None;
        }

        debug!("Received request {}", request.request_id);
        let dispatcher = self.clone();
        Some(tokio::spawn(async move { dispatcher.handle(request).await }))
    }

    /// Execute and publish exactly one reply
    pub async fn handle(&self, request: InvocationRequest) {
        let reply = {
            let Ok(_permit) = self.permits.acquire().await else {
                error!("Dispatcher closed, dropping {}", request.request_id);
                return;
            };
            self.executor.execute(&request).await
        };
        self.publish_reply(&request.request_id, &reply).await;
    }

    async fn publish_reply(&self, request_id: &str, reply: &Value) {
        let channel = reply_channel(request_id);
        let events = match encode_reply(reply) {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to encode reply for {}: {}", request_id, e);
                return;
            }
        };

        let mut delay = self.retry.initial_delay;
        for attempt in 1..=self.retry.attempts {
            match self.publisher.publish(&channel, events.clone()).await {
                Ok(ack) if ack.all_accepted() => {
                    debug!("Reply for {} published", request_id);
                    return;
                }
                Ok(ack) => warn!(
                    "Reply for {} rejected by relay ({} failed), attempt {}/{}",
                    request_id,
                    ack.failed.len(),
                    attempt,
                    self.retry.attempts
                ),
                Err(e) => warn!(
                    "Failed to publish reply for {}, attempt {}/{}: {}",
                    request_id, attempt, self.retry.attempts, e
                ),
            }
            if attempt < self.retry.attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        error!(
            "Giving up on reply for {} after {} attempts",
            request_id, self.retry.attempts
        );
    }
}

fn parse_request(payload: &str) -> Result<InvocationRequest> {
    let request: InvocationRequest = serde_json::from_str(payload)
        .map_err(|e| TunnelError::InvalidMessage(format!("Failed to parse request: {}", e)))?;
    validate_request_id(&request.request_id)
        .map_err(|e| TunnelError::InvalidMessage(e.to_string()))?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvocationError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingPublisher {
        failures: AtomicUsize,
        published: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl RecordingPublisher {
        fn failing(times: usize) -> Self {
            Self {
                failures: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn published(&self) -> Vec<(String, Vec<String>)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplyPublisher for RecordingPublisher {
        async fn publish(&self, channel: &str, events: Vec<String>) -> Result<PublishAck> {
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), events));
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(TunnelError::ConnectionClosed);
            }
            Ok(PublishAck {
                successful: vec![json!({"identifier": "1", "index": 0})],
                failed: vec![],
            })
        }
    }

    struct StaticExecutor {
        reply: Value,
        seen: Mutex<Vec<InvocationRequest>>,
    }

    impl StaticExecutor {
        fn new(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Executor for StaticExecutor {
        async fn execute(&self, request: &InvocationRequest) -> Value {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone()
        }
    }

    fn fast_retry() -> ReplyRetry {
        ReplyRetry {
            attempts: 3,
            initial_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_request_produces_exactly_one_reply() {
        let executor = StaticExecutor::new(json!({"statusCode": 200, "body": "ok"}));
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(executor.clone(), publisher.clone(), 4);

        dispatcher
            .dispatch(r#"{"request_id":"r1","event_payload":{"a":1}}"#.to_string())
            .unwrap()
            .await
            .unwrap();

        assert_eq!(
            publisher.published(),
            vec![(
                "response/r1".to_string(),
                vec![r#"{"statusCode":200,"body":"ok"}"#.to_string()]
            )]
        );
        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].event_payload, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_handler_error_reply_is_published() {
        let reply = InvocationError::Handler {
            error_type: "Error".to_string(),
            message: "boom".to_string(),
            trace: vec![],
        }
        .to_reply();
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(StaticExecutor::new(reply), publisher.clone(), 4);

        dispatcher
            .dispatch(r#"{"request_id":"r2"}"#.to_string())
            .unwrap()
            .await
            .unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        let sent: Value = serde_json::from_str(&published[0].1[0]).unwrap();
        assert_eq!(sent["statusCode"], 500);
        assert!(sent["body"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_ignored() {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(StaticExecutor::new(json!("ok")), publisher.clone(), 4);

        let first = dispatcher.dispatch(r#"{"request_id":"r1"}"#.to_string());
        let second = dispatcher.dispatch(r#"{"request_id":"r1"}"#.to_string());
        assert!(second.is_none());
        first.unwrap().await.unwrap();

        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_messages_are_dropped() {
        let publisher = Arc::new(RecordingPublisher::default());
        let executor = StaticExecutor::new(json!("ok"));
        let dispatcher = Dispatcher::new(executor.clone(), publisher.clone(), 4);

        for payload in [
            "not json",
            r#"{"event_payload":{"a":1}}"#,
            r#"{"request_id":"../escape"}"#,
            r#"{"request_id":""}"#,
            r#"{"request_id":"Root=1-5759e988:bd862e3f"}"#,
        ] {
            assert!(dispatcher.dispatch(payload.to_string()).is_none());
        }
        assert!(publisher.published().is_empty());
        assert!(executor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reply_publish_is_retried() {
        let publisher = Arc::new(RecordingPublisher::failing(2));
        let dispatcher = Dispatcher::new(StaticExecutor::new(json!("ok")), publisher.clone(), 4)
            .with_retry(fast_retry());

        dispatcher
            .dispatch(r#"{"request_id":"r1"}"#.to_string())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(publisher.published().len(), 3);
    }

    #[tokio::test]
    async fn test_reply_publish_gives_up() {
        let publisher = Arc::new(RecordingPublisher::failing(10));
        let dispatcher = Dispatcher::new(StaticExecutor::new(json!("ok")), publisher.clone(), 4)
            .with_retry(fast_retry());

        dispatcher
            .dispatch(r#"{"request_id":"r1"}"#.to_string())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(publisher.published().len(), 3);
    }

    struct CountingExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Executor for CountingExecutor {
        async fn execute(&self, _request: &InvocationRequest) -> Value {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Value::Null
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let executor = Arc::new(CountingExecutor {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(executor.clone(), publisher.clone(), 2);

        let handles: Vec<_> = (0..6)
            .filter_map(|i| dispatcher.dispatch(format!(r#"{{"request_id":"r{}"}}"#, i)))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.published().len(), 6);
    }

    #[tokio::test]
    async fn test_tunnel_round_trip() {
        use crate::config::ReconnectConfig;
        use crate::supervisor::Supervisor;
        use crate::testing::{RelayStub, StubOptions, relay_config};
        use live_lambda_common::constants::REQUEST_CHANNEL;
        use live_lambda_common::{Credentials, RelayMessage};

        let mut stub = RelayStub::start(StubOptions {
            data_after_subscribe: Some(r#"{"request_id":"r1","event_payload":{"a":1}}"#),
            ..Default::default()
        })
        .await;
        let (transport, events) = TunnelTransport::new(
            relay_config(&stub.url),
            Arc::new(Credentials::new("AKIDEXAMPLE", "secret")),
        );
        let dispatcher = Dispatcher::new(
            StaticExecutor::new(json!({"statusCode": 200, "body": "ok"})),
            Arc::new(transport.clone()),
            4,
        );
        let supervisor = Supervisor::new(
            transport.clone(),
            events,
            ReconnectConfig::default(),
            REQUEST_CHANNEL,
            dispatcher.data_handler(),
        );
        let handle = tokio::spawn(supervisor.run());

        match stub
            .wait_for(|frame| matches!(frame, RelayMessage::Publish { .. }))
            .await
        {
            RelayMessage::Publish {
                channel,
                events,
                authorization,
                ..
            } => {
                assert_eq!(channel, "/test/response/r1");
                assert_eq!(events, vec![r#"{"statusCode":200,"body":"ok"}"#.to_string()]);
                assert!(authorization.contains_key("authorization"));
            }
            other => panic!("Expected publish, got {:?}", other),
        }

        handle.abort();
        transport.disconnect().await.unwrap();
    }

    #[test]
    fn test_recent_requests_forget_oldest() {
        let mut recent = RecentRequests::new(2);
        assert!(recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("c"));
        // "a" was evicted
        assert!(recent.insert("a"));
        assert!(!recent.insert("c"));
    }
}
