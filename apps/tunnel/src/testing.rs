//! In-process relay stub shared by the transport, supervisor and tunnel tests

use crate::config::RelayConfig;
use futures_util::{SinkExt, StreamExt};
use live_lambda_common::constants::RELAY_SUBPROTOCOL;
use live_lambda_common::{RelayError, RelayMessage};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;

#[derive(Clone, Copy)]
pub enum PublishMode {
    Ack,
    Reject,
    CloseConnection,
}

#[derive(Clone, Copy)]
pub struct StubOptions {
    pub keepalive_ms: u64,
    pub publish: PublishMode,
    pub data_after_subscribe: Option<&'static str>,
    /// Close the first connection right after acknowledging its subscribe
    pub drop_first_connection: bool,
    /// Close the first connection right after its handshake ack
    pub drop_first_after_ack: bool,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            keepalive_ms: 60_000,
            publish: PublishMode::Ack,
            data_after_subscribe: None,
            drop_first_connection: false,
            drop_first_after_ack: false,
        }
    }
}

pub struct RelayStub {
    pub url: String,
    pub frames: mpsc::UnboundedReceiver<RelayMessage>,
    pub protocols: Arc<Mutex<Vec<String>>>,
    pub connections: Arc<AtomicUsize>,
    /// Connection index of every subscribe received, in order
    pub subscribes: Arc<Mutex<Vec<usize>>>,
}

impl RelayStub {
    pub async fn start(options: StubOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/event/realtime", listener.local_addr().unwrap());
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let protocols = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let subscribes = Arc::new(Mutex::new(Vec::new()));

        let accepted_protocols = protocols.clone();
        let accepted = connections.clone();
        let accepted_subscribes = subscribes.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = accepted.fetch_add(1, Ordering::SeqCst) + 1;
                let protocols = accepted_protocols.clone();
                let frames_tx = frames_tx.clone();
                let subscribes = accepted_subscribes.clone();
                tokio::spawn(serve(
                    stream, index, options, protocols, subscribes, frames_tx,
                ));
            }
        });

        Self {
            url,
            frames,
            protocols,
            connections,
            subscribes,
        }
    }

    pub async fn next_frame(&mut self) -> RelayMessage {
        tokio::time::timeout(Duration::from_secs(3), self.frames.recv())
            .await
            .expect("relay stub received nothing")
            .expect("relay stub stopped")
    }

    /// Skip frames until one matches
    pub async fn wait_for<F>(&mut self, mut matches: F) -> RelayMessage
    where
        F: FnMut(&RelayMessage) -> bool,
    {
        loop {
            let frame = self.next_frame().await;
            if matches(&frame) {
                return frame;
            }
        }
    }
}

pub fn relay_config(url: &str) -> RelayConfig {
    RelayConfig {
        api_host: "stub.appsync-api.us-east-1.amazonaws.com".to_string(),
        realtime_url: url.to_string(),
        region: "us-east-1".to_string(),
        namespace: "test".to_string(),
        connect_timeout: Duration::from_secs(2),
        default_keepalive: Duration::from_secs(60),
        keepalive_grace: Duration::from_millis(50),
    }
}

async fn serve(
    stream: TcpStream,
    index: usize,
    options: StubOptions,
    protocols: Arc<Mutex<Vec<String>>>,
    subscribes: Arc<Mutex<Vec<usize>>>,
    frames_tx: mpsc::UnboundedSender<RelayMessage>,
) {
    let callback =
        move |req: &Request, mut resp: Response| -> std::result::Result<Response, ErrorResponse> {
            if let Some(requested) = req.headers().get("Sec-WebSocket-Protocol") {
                protocols
                    .lock()
                    .unwrap()
                    .push(requested.to_str().unwrap().to_string());
            }
            resp.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(RELAY_SUBPROTOCOL),
            );
            Ok(resp)
        };
    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        return;
    };

    while let Some(Ok(message)) = ws.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let frame: RelayMessage = serde_json::from_str(&text).unwrap();
        let _ = frames_tx.send(frame.clone());

        let mut close = false;
        let replies = match frame {
            RelayMessage::ConnectionInit => {
                close = options.drop_first_after_ack && index == 1;
                vec![
                    RelayMessage::ConnectionAck {
                        connection_timeout_ms: Some(options.keepalive_ms),
                    },
                    RelayMessage::Ka,
                ]
            }
            RelayMessage::Subscribe { id, .. } => {
                subscribes.lock().unwrap().push(index);
                let mut replies = vec![RelayMessage::SubscribeSuccess { id: id.clone() }];
                if let Some(data) = options.data_after_subscribe {
                    replies.push(RelayMessage::Data {
                        id,
                        event: json!(data),
                    });
                }
                close = options.drop_first_connection && index == 1;
                replies
            }
            RelayMessage::Publish { id, .. } => match options.publish {
                PublishMode::Ack => vec![RelayMessage::PublishSuccess {
                    id,
                    successful: vec![json!({"identifier": "evt-1", "index": 0})],
                    failed: vec![],
                }],
                PublishMode::Reject => vec![RelayMessage::PublishError {
                    id: Some(id),
                    errors: vec![RelayError {
                        error_type: "UnauthorizedException".to_string(),
                        message: "You are not authorized".to_string(),
                    }],
                }],
                PublishMode::CloseConnection => {
                    close = true;
                    vec![]
                }
            },
            RelayMessage::Unsubscribe { id } => vec![RelayMessage::UnsubscribeSuccess { id }],
            _ => vec![],
        };

        for reply in replies {
            let json = serde_json::to_string(&reply).unwrap();
            if ws.send(WsMessage::Text(json.into())).await.is_err() {
                return;
            }
        }
        if close {
            let _ = ws.close(None).await;
        }
    }
}
