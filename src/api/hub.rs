//! Per-request event fan-out and cancellation.
//!
//! Each accepted request gets one channel entry: a replayable event log, a
//! broadcast sender for live subscribers, and the cancellation token the
//! engine watches. New SSE clients replay the log first and then follow the
//! broadcast, so a page refresh never loses progress.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::RequestEvent;

use super::types::{RequestPhase, RequestSnapshot};

/// Broadcast capacity per request. Slow clients lag rather than block the
/// engine; a lagged client can recover from the snapshot endpoint.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct RequestChannel {
    log: RwLock<Vec<RequestEvent>>,
    live: broadcast::Sender<RequestEvent>,
    cancel: CancellationToken,
}

impl RequestChannel {
    fn new() -> Self {
        let (live, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            log: RwLock::new(Vec::new()),
            live,
            cancel: CancellationToken::new(),
        }
    }
}

fn phase_of(log: &[RequestEvent]) -> RequestPhase {
    match log.last() {
        Some(RequestEvent::Final { .. }) => RequestPhase::Completed,
        Some(RequestEvent::Failed { .. }) => RequestPhase::Failed,
        _ => RequestPhase::Running,
    }
}

/// Registry of live and finished requests.
///
/// Entries are kept after completion so snapshots and late event streams
/// keep working; long-term storage is the run history store.
pub struct RequestHub {
    requests: RwLock<HashMap<Uuid, Arc<RequestChannel>>>,
}

impl RequestHub {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
        }
    }

    /// Create the channel for a freshly accepted request and return the
    /// cancellation token its run should watch.
    pub async fn register(&self, request_id: Uuid) -> CancellationToken {
        let channel = Arc::new(RequestChannel::new());
        let cancel = channel.cancel.clone();
        self.requests.write().await.insert(request_id, channel);
        cancel
    }

    /// Append an event to the request's log and fan it out to subscribers.
    ///
    /// The broadcast happens under the log lock, so a subscriber that
    /// snapshots the log while subscribing sees every event exactly once.
    pub async fn publish(&self, request_id: Uuid, event: RequestEvent) {
        let channel = match self.get(request_id).await {
            Some(channel) => channel,
            None => {
                tracing::warn!(%request_id, "dropping event for unknown request");
                return;
            }
        };
        let mut log = channel.log.write().await;
        log.push(event.clone());
        let _ = channel.live.send(event);
    }

    /// Replay of everything emitted so far plus a live receiver for the rest.
    pub async fn subscribe(
        &self,
        request_id: Uuid,
    ) -> Option<(Vec<RequestEvent>, broadcast::Receiver<RequestEvent>)> {
        let channel = self.get(request_id).await?;
        let log = channel.log.read().await;
        let receiver = channel.live.subscribe();
        Some((log.clone(), receiver))
    }

    /// Current state of one request.
    pub async fn snapshot(&self, request_id: Uuid) -> Option<RequestSnapshot> {
        let channel = self.get(request_id).await?;
        let log = channel.log.read().await;
        Some(RequestSnapshot {
            request_id,
            phase: phase_of(&log),
            events: log.clone(),
        })
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `None` for an unknown id and `Some(false)` when the request
    /// has already emitted its terminal event.
    pub async fn cancel(&self, request_id: Uuid) -> Option<bool> {
        let channel = self.get(request_id).await?;
        let log = channel.log.read().await;
        if phase_of(&log) != RequestPhase::Running {
            return Some(false);
        }
        channel.cancel.cancel();
        Some(true)
    }

    /// Cancel every request that is still running. Returns how many were
    /// signalled.
    pub async fn cancel_all(&self) -> usize {
        let channels: Vec<Arc<RequestChannel>> =
            self.requests.read().await.values().cloned().collect();
        let mut cancelled = 0;
        for channel in channels {
            let log = channel.log.read().await;
            if phase_of(&log) == RequestPhase::Running {
                channel.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    async fn get(&self, request_id: Uuid) -> Option<Arc<RequestChannel>> {
        self.requests.read().await.get(&request_id).cloned()
    }
}

impl Default for RequestHub {
    fn default() -> Self {
        Self::new()
    }
}
