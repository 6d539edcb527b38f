//! Per-destination ordered delivery.
//!
//! Every destination owns one stream: a spawned task draining an unbounded
//! channel. A stream delivers one entry at a time, in enqueue order, retrying
//! it in place until it is delivered or runs out of attempts. Streams for
//! different destinations run independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{AssetApi, DeliveryError};
use crate::config::{Destination, QueueConfig};
use crate::error::SyncError;
use crate::role::{AssetKey, DestinationId};
use crate::stats::{QueueStats, QueueSummary};

/// Remote operation carried by an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetRequest {
    /// Upsert with a base64 attachment
    Put { key: AssetKey, attachment: Arc<str> },
    Delete { key: AssetKey },
}

impl AssetRequest {
    pub fn key(&self) -> &AssetKey {
        match self {
            AssetRequest::Put { key, .. } | AssetRequest::Delete { key } => key,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            AssetRequest::Put { .. } => "PUT",
            AssetRequest::Delete { .. } => "DELETE",
        }
    }
}

/// Lifecycle of one queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    InFlight,
    Retrying,
    Delivered,
    Failed,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Delivered | EntryState::Failed)
    }

    /// Allowed edges: Pending -> InFlight -> {Delivered | Retrying -> InFlight | Failed}
    pub fn can_transition(&self, next: EntryState) -> bool {
        matches!(
            (self, next),
            (EntryState::Pending, EntryState::InFlight)
                | (EntryState::InFlight, EntryState::Delivered)
                | (EntryState::InFlight, EntryState::Retrying)
                | (EntryState::InFlight, EntryState::Failed)
                | (EntryState::Retrying, EntryState::InFlight)
        )
    }
}

/// Terminal result of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: DeliveryError },
}

impl EntryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, EntryOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            EntryOutcome::Delivered { attempts } | EntryOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// One request waiting in, or moving through, a destination stream
#[derive(Debug)]
pub struct QueueEntry {
    pub destination: DestinationId,
    pub request: AssetRequest,
    pub attempts: u32,
    pub state: EntryState,
    reply: Option<oneshot::Sender<EntryOutcome>>,
}

impl QueueEntry {
    fn new(
        destination: DestinationId,
        request: AssetRequest,
        reply: oneshot::Sender<EntryOutcome>,
    ) -> Self {
        Self {
            destination,
            request,
            attempts: 0,
            state: EntryState::Pending,
            reply: Some(reply),
        }
    }

    fn transition(&mut self, next: EntryState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal entry transition {:?} -> {:?}",
            self.state,
            next
        );
        if next == EntryState::InFlight {
            self.attempts += 1;
        }
        self.state = next;
    }

    fn resolve(&mut self, outcome: EntryOutcome) {
        if let Some(reply) = self.reply.take() {
            // Nobody waiting on the ticket is fine
            let _ = reply.send(outcome);
        }
    }
}

/// Handle to one enqueued entry's terminal outcome
#[derive(Debug)]
pub struct Ticket {
    destination: DestinationId,
    key: AssetKey,
    rx: oneshot::Receiver<EntryOutcome>,
}

impl Ticket {
    pub fn destination(&self) -> &DestinationId {
        &self.destination
    }

    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    /// Wait for the entry to be delivered or to fail terminally
    pub async fn outcome(self) -> EntryOutcome {
        self.rx.await.unwrap_or_else(|_| EntryOutcome::Failed {
            attempts: 0,
            error: DeliveryError::Request("delivery stream closed".to_string()),
        })
    }
}

/// Attempt ceiling and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failed. A server-provided
    /// Retry-After wins over the exponential schedule
    pub fn delay(&self, attempt: u32, error: &DeliveryError) -> Duration {
        if let Some(retry_after) = error.retry_after() {
            return retry_after;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

struct Stream {
    tx: mpsc::UnboundedSender<QueueEntry>,
    handle: JoinHandle<()>,
}

/// Ordered delivery streams, one per destination. The stream map is fixed at
/// construction, so enqueueing never locks
pub struct RequestQueue {
    streams: HashMap<DestinationId, Stream>,
    order: Vec<DestinationId>,
    stats: Arc<QueueStats>,
}

impl RequestQueue {
    /// Spawn one stream per destination. Must be called inside a tokio runtime
    pub fn new(
        destinations: Vec<Destination>,
        api: Arc<dyn AssetApi>,
        policy: RetryPolicy,
    ) -> Self {
        let stats = Arc::new(QueueStats::new());
        let mut streams = HashMap::with_capacity(destinations.len());
        let mut order = Vec::with_capacity(destinations.len());

        for destination in destinations {
            if streams.contains_key(&destination.id) {
                warn!(destination = %destination.id, "duplicate destination ignored");
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let id = destination.id.clone();
            let handle = tokio::spawn(run_stream(
                destination,
                rx,
                Arc::clone(&api),
                policy,
                Arc::clone(&stats),
            ));
            order.push(id.clone());
            streams.insert(id, Stream { tx, handle });
        }

        Self {
            streams,
            order,
            stats,
        }
    }

    /// Destination ids in configuration order
    pub fn destinations(&self) -> &[DestinationId] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn stats(&self) -> QueueSummary {
        self.stats.snapshot()
    }

    /// Append `request` to `destination`'s stream
    pub fn enqueue(
        &self,
        destination: &DestinationId,
        request: AssetRequest,
    ) -> Result<Ticket, SyncError> {
        let stream = self
            .streams
            .get(destination)
            .ok_or_else(|| SyncError::UnknownDestination {
                destination: destination.to_string(),
            })?;

        let (reply, rx) = oneshot::channel();
        let key = request.key().clone();
        debug!(destination = %destination, key = %key, method = request.method(), "enqueue");

        stream
            .tx
            .send(QueueEntry::new(destination.clone(), request, reply))
            .map_err(|_| SyncError::Delivery {
                destination: destination.to_string(),
                key: key.to_string(),
                message: "delivery stream closed".to_string(),
            })?;

        Ok(Ticket {
            destination: destination.clone(),
            key,
            rx,
        })
    }

    /// Enqueue `request` on every destination
    pub fn broadcast(&self, request: AssetRequest) -> Vec<Ticket> {
        let mut tickets = Vec::with_capacity(self.order.len());
        for destination in &self.order {
            match self.enqueue(destination, request.clone()) {
                Ok(ticket) => tickets.push(ticket),
                Err(e) => error!(destination = %destination, error = %e, "enqueue failed"),
            }
        }
        tickets
    }

    /// Close every stream and wait for queued entries to finish
    pub async fn drain(self) -> QueueSummary {
        let Self { streams, stats, .. } = self;
        let mut handles = Vec::with_capacity(streams.len());
        for (id, stream) in streams {
            drop(stream.tx);
            handles.push((id, stream.handle));
        }

        for (id, handle) in handles {
            if let Err(e) = handle.await {
                error!(destination = %id, error = %e, "delivery stream aborted");
            }
        }

        stats.snapshot()
    }
}

async fn run_stream(
    destination: Destination,
    mut rx: mpsc::UnboundedReceiver<QueueEntry>,
    api: Arc<dyn AssetApi>,
    policy: RetryPolicy,
    stats: Arc<QueueStats>,
) {
    while let Some(mut entry) = rx.recv().await {
        let outcome = deliver(&destination, &mut entry, api.as_ref(), &policy, &stats).await;
        entry.resolve(outcome);
    }
    debug!(destination = %destination.id, "stream closed");
}

async fn deliver(
    destination: &Destination,
    entry: &mut QueueEntry,
    api: &dyn AssetApi,
    policy: &RetryPolicy,
    stats: &QueueStats,
) -> EntryOutcome {
    loop {
        entry.transition(EntryState::InFlight);

        let result = match &entry.request {
            AssetRequest::Put { key, attachment } => api.put(destination, key, attachment).await,
            AssetRequest::Delete { key } => api.delete(destination, key).await,
        };

        match result {
            Ok(()) => {
                entry.transition(EntryState::Delivered);
                stats.delivered.add(1);
                info!(
                    destination = %destination.id,
                    key = %entry.request.key(),
                    method = entry.request.method(),
                    attempts = entry.attempts,
                    "delivered"
                );
                return EntryOutcome::Delivered {
                    attempts: entry.attempts,
                };
            }
            Err(error) if entry.attempts < policy.max_attempts => {
                entry.transition(EntryState::Retrying);
                stats.retried.add(1);
                let delay = policy.delay(entry.attempts, &error);
                warn!(
                    destination = %destination.id,
                    key = %entry.request.key(),
                    attempt = entry.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                entry.transition(EntryState::Failed);
                stats.failed.add(1);
                error!(
                    destination = %destination.id,
                    key = %entry.request.key(),
                    attempts = entry.attempts,
                    error = %error,
                    "delivery failed"
                );
                return EntryOutcome::Failed {
                    attempts: entry.attempts,
                    error,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records completed calls; per-key latency and failure budgets
    #[derive(Default)]
    struct FakeApi {
        delays: HashMap<String, Duration>,
        failures: Mutex<HashMap<String, u32>>,
        completed: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn delay(mut self, key: &str, ms: u64) -> Self {
            self.delays.insert(key.to_string(), Duration::from_millis(ms));
            self
        }

        fn fail(self, key: &str, times: u32) -> Self {
            self.failures.lock().unwrap().insert(key.to_string(), times);
            self
        }

        fn completed(&self) -> Vec<String> {
            self.completed.lock().unwrap().clone()
        }

        async fn call(
            &self,
            destination: &Destination,
            method: &str,
            key: &AssetKey,
        ) -> Result<(), DeliveryError> {
            if let Some(delay) = self.delays.get(key.as_str()) {
                tokio::time::sleep(*delay).await;
            }
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(left) = failures.get_mut(key.as_str()) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(DeliveryError::ServerError {
                            status: 500,
                            body: String::new(),
                        });
                    }
                }
            }
            self.completed
                .lock()
                .unwrap()
                .push(format!("{} {} {}", destination.store, method, key));
            Ok(())
        }
    }

    #[async_trait]
    impl AssetApi for FakeApi {
        async fn put(
            &self,
            destination: &Destination,
            key: &AssetKey,
            _attachment: &str,
        ) -> Result<(), DeliveryError> {
            self.call(destination, "PUT", key).await
        }

        async fn delete(
            &self,
            destination: &Destination,
            key: &AssetKey,
        ) -> Result<(), DeliveryError> {
            self.call(destination, "DELETE", key).await
        }
    }

    fn destination(store: &str) -> Destination {
        Destination::new(store, 1, "dev")
    }

    fn put(key: &str) -> AssetRequest {
        AssetRequest::Put {
            key: AssetKey::new(key),
            attachment: Arc::from("e30="),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    // ==================== RetryPolicy tests ====================

    #[test]
    fn test_retry_policy_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        };
        let err = DeliveryError::Timeout;
        assert_eq!(policy.delay(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay(2, &err), Duration::from_millis(1000));
        assert_eq!(policy.delay(3, &err), Duration::from_millis(2000));
        assert_eq!(policy.delay(6, &err), Duration::from_secs(10));
        assert_eq!(policy.delay(64, &err), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_policy_honours_retry_after() {
        let err = DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(RetryPolicy::default().delay(1, &err), Duration::from_secs(3));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = RetryPolicy::from(&QueueConfig {
            max_attempts: 0,
            backoff_ms: 10,
            max_backoff_ms: 20,
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff, Duration::from_millis(10));
    }

    // ==================== EntryState tests ====================

    #[test]
    fn test_entry_state_transitions() {
        assert!(EntryState::Pending.can_transition(EntryState::InFlight));
        assert!(EntryState::InFlight.can_transition(EntryState::Retrying));
        assert!(EntryState::Retrying.can_transition(EntryState::InFlight));
        assert!(!EntryState::Pending.can_transition(EntryState::Delivered));
        assert!(!EntryState::Delivered.can_transition(EntryState::InFlight));
        assert!(!EntryState::Failed.can_transition(EntryState::Retrying));
        assert!(EntryState::Failed.is_terminal());
        assert!(!EntryState::Retrying.is_terminal());
    }

    #[test]
    fn test_entry_counts_attempts_on_in_flight() {
        let (tx, _rx) = oneshot::channel();
        let mut entry = QueueEntry::new(DestinationId::from("a/1"), put("assets/a.css"), tx);
        entry.transition(EntryState::InFlight);
        entry.transition(EntryState::Retrying);
        entry.transition(EntryState::InFlight);
        assert_eq!(entry.attempts, 2);
    }

    // ==================== RequestQueue tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_single_destination_preserves_enqueue_order() {
        let api = Arc::new(FakeApi::default().delay("assets/a.css", 100).delay("assets/b.css", 10));
        let dest = destination("one");
        let id = dest.id.clone();
        let queue = RequestQueue::new(vec![dest], api.clone(), policy(3));

        let a = queue.enqueue(&id, put("assets/a.css")).unwrap();
        let b = queue.enqueue(&id, put("assets/b.css")).unwrap();

        assert!(a.outcome().await.is_delivered());
        assert!(b.outcome().await.is_delivered());
        assert_eq!(api.completed(), vec!["one PUT assets/a.css", "one PUT assets/b.css"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destinations_run_concurrently() {
        let api = Arc::new(
            FakeApi::default()
                .delay("assets/slow.css", 100)
                .delay("assets/fast.css", 10),
        );
        let one = destination("one");
        let two = destination("two");
        let (one_id, two_id) = (one.id.clone(), two.id.clone());
        let queue = RequestQueue::new(vec![one, two], api.clone(), policy(3));

        let slow = queue.enqueue(&one_id, put("assets/slow.css")).unwrap();
        let fast = queue.enqueue(&two_id, put("assets/fast.css")).unwrap();
        slow.outcome().await;
        fast.outcome().await;

        assert_eq!(api.completed(), vec!["two PUT assets/fast.css", "one PUT assets/slow.css"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_delivered() {
        let api = Arc::new(FakeApi::default().fail("assets/a.css", 2));
        let dest = destination("one");
        let id = dest.id.clone();
        let queue = RequestQueue::new(vec![dest], api, policy(3));

        let outcome = queue.enqueue(&id, put("assets/a.css")).unwrap().outcome().await;

        assert_eq!(outcome, EntryOutcome::Delivered { attempts: 3 });
        let stats = queue.drain().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retried, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_entry_fails_without_blocking_stream() {
        let api = Arc::new(FakeApi::default().fail("assets/bad.css", 10));
        let dest = destination("one");
        let id = dest.id.clone();
        let queue = RequestQueue::new(vec![dest], api.clone(), policy(3));

        let bad = queue.enqueue(&id, put("assets/bad.css")).unwrap();
        let good = queue
            .enqueue(&id, AssetRequest::Delete { key: AssetKey::new("assets/old.css") })
            .unwrap();

        assert!(matches!(bad.outcome().await, EntryOutcome::Failed { attempts: 3, .. }));
        assert_eq!(good.outcome().await, EntryOutcome::Delivered { attempts: 1 });
        assert_eq!(api.completed(), vec!["one DELETE assets/old.css"]);

        let stats = queue.drain().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let queue =
            RequestQueue::new(vec![destination("one")], Arc::new(FakeApi::default()), policy(1));
        let result = queue.enqueue(&DestinationId::from("nope/1"), put("assets/a.css"));
        assert!(matches!(result, Err(SyncError::UnknownDestination { .. })));
    }

    #[tokio::test]
    async fn test_broadcast_and_drain() {
        let api = Arc::new(FakeApi::default());
        let queue = RequestQueue::new(
            vec![destination("one"), destination("two"), destination("one")],
            api.clone(),
            policy(1),
        );
        assert_eq!(queue.destinations().len(), 2);

        let tickets = queue.broadcast(put("assets/a.css"));
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].key().as_str(), "assets/a.css");

        let stats = queue.drain().await;
        assert_eq!(stats.delivered, 2);
        let mut completed = api.completed();
        completed.sort();
        assert_eq!(completed, vec!["one PUT assets/a.css", "two PUT assets/a.css"]);
    }
}
