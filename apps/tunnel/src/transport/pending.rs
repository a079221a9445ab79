//! Table of in-flight relay operations keyed by correlation id
//!
//! Every subscribe/publish/unsubscribe registers a one-shot completion slot
//! here before its frame is sent. Acks and errors resolve exactly the entry
//! bearing their id. Subscriptions stay registered after their ack so that
//! later `data` frames reach the subscriber's continuation.

use live_lambda_common::{RelayMessage, Result, TunnelError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Continuation invoked with the raw payload of every `data` frame
pub type DataHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Completion slot of one operation, fulfilled with its terminal ack
pub type Completion = oneshot::Receiver<Result<RelayMessage>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Subscribe,
    Publish,
    Unsubscribe,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Subscribe => "subscribe",
            OperationKind::Publish => "publish",
            OperationKind::Unsubscribe => "unsubscribe",
        }
    }
}

struct PendingOperation {
    kind: OperationKind,
    completion: Option<oneshot::Sender<Result<RelayMessage>>>,
    on_data: Option<DataHandler>,
}

#[derive(Default)]
pub struct PendingTable {
    ops: Mutex<HashMap<String, PendingOperation>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn ops(&self) -> MutexGuard<'_, HashMap<String, PendingOperation>> {
        self.ops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an operation and return its completion slot
    pub fn register(
        &self,
        id: &str,
        kind: OperationKind,
        on_data: Option<DataHandler>,
    ) -> Completion {
        let (tx, rx) = oneshot::channel();
        let previous = self.ops().insert(
            id.to_string(),
            PendingOperation {
                kind,
                completion: Some(tx),
                on_data,
            },
        );
        if previous.is_some() {
            warn!("Correlation id {} was reused, dropping previous operation", id);
        }
        rx
    }

    /// Resolve the operation `id` with a success ack of type `kind`.
    ///
    /// Subscriptions remain registered for data delivery; other operations
    /// are removed. Returns false when no matching operation is waiting.
    pub fn resolve(&self, id: &str, kind: OperationKind, ack: RelayMessage) -> bool {
        let mut ops = self.ops();
        let Some(op) = ops.get_mut(id) else {
            debug!("Ack {} for unknown id {}", ack.kind(), id);
            return false;
        };
        if op.kind != kind {
            warn!(
                "Ack {} does not match pending {} for id {}",
                ack.kind(),
                op.kind.as_str(),
                id
            );
            return false;
        }

        let completion = if kind == OperationKind::Subscribe {
            op.completion.take()
        } else {
            ops.remove(id).and_then(|op| op.completion)
        };

        match completion {
            Some(tx) => {
                let _ = tx.send(Ok(ack));
                true
            }
            None => false,
        }
    }

    /// Reject and remove the operation `id`
    pub fn reject(&self, id: &str, error: TunnelError) -> bool {
        let Some(op) = self.ops().remove(id) else {
            return false;
        };
        match op.completion {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            // An active subscription was dropped by the relay
            None => true,
        }
    }

    /// Hand a data payload to the continuation registered for `id`
    pub fn deliver(&self, id: &str, payload: String) -> bool {
        let handler = self.ops().get(id).and_then(|op| op.on_data.clone());
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    /// Turn an active subscription into a pending unsubscribe.
    ///
    /// Returns `None` when no subscription with this id exists.
    pub fn begin_unsubscribe(&self, id: &str) -> Option<Completion> {
        let mut ops = self.ops();
        let op = ops.get_mut(id)?;
        if op.on_data.is_none() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        op.kind = OperationKind::Unsubscribe;
        op.completion = Some(tx);
        Some(rx)
    }

    /// Remove an operation without completing it
    pub fn remove(&self, id: &str) {
        self.ops().remove(id);
    }

    /// Fail every operation, used when the connection closes
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingOperation> = self.ops().drain().map(|(_, op)| op).collect();
        let count = drained.len();
        for op in drained {
            if let Some(tx) = op.completion {
                let _ = tx.send(Err(TunnelError::ConnectionClosed));
            }
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ops().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ops().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
