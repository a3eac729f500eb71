//! Per-execution stream worker and the registry that owns workers.
//!
//! The worker is the single consumer of an execution's event channel. It
//! numbers each event, appends it to the event log and forwards it to live
//! subscribers, all under one gate lock. Subscribing takes the same lock, so
//! a subscriber's history and its live feed never overlap or leave a gap.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, Stream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{DoneReason, EventKind, StreamEvent};
use flowline_core::types::{EventId, ExecutionId, ExecutionStatus};

use crate::log::{self, EventLogStore};

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Live side of a subscription. Keeps the store so a lagging receiver can
/// catch up from the log.
pub struct LiveFeed {
    rx: broadcast::Receiver<StreamEvent>,
    execution_id: ExecutionId,
    store: Arc<dyn EventLogStore>,
}

/// What a subscriber gets: stored history, then the live feed unless the
/// run already finished.
pub struct Subscription {
    pub history: Vec<StreamEvent>,
    pub live: Option<LiveFeed>,
}

impl Subscription {
    pub fn history_only(history: Vec<StreamEvent>) -> Self {
        Self { history, live: None }
    }

    /// Flatten into one stream that ends right after `Done`.
    pub fn into_stream(self) -> EventStream {
        let cursor = Cursor {
            pending: self.history.into(),
            live: self.live,
            last: None,
            finished: false,
        };
        Box::pin(stream::unfold(cursor, |mut cursor| async move {
            let event = cursor.next().await?;
            Some((event, cursor))
        }))
    }
}

struct Cursor {
    pending: VecDeque<StreamEvent>,
    live: Option<LiveFeed>,
    last: Option<EventId>,
    finished: bool,
}

impl Cursor {
    async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                // Catch-up reads overlap what the channel still holds.
                if self.last.is_some_and(|last| event.id <= last) {
                    continue;
                }
                self.last = Some(event.id);
                self.finished = event.is_done();
                return Some(event);
            }
            let feed = self.live.as_mut()?;
            match feed.rx.recv().await {
                Ok(event) => self.pending.push_back(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        execution_id = %feed.execution_id,
                        skipped,
                        "Subscriber lagged, catching up from the event log"
                    );
                    match feed.store.get(&feed.execution_id).await {
                        Ok(Some(stored)) => {
                            let last = self.last;
                            self.pending.extend(
                                stored
                                    .events
                                    .into_iter()
                                    .filter(|e| last.map_or(true, |last| e.id > last)),
                            );
                        }
                        Ok(None) => {
                            warn!(execution_id = %feed.execution_id, "Event log gone, ending lagged stream");
                            return None;
                        }
                        Err(e) => {
                            warn!(execution_id = %feed.execution_id, error = %e, "Catch-up read failed, ending lagged stream");
                            return None;
                        }
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

struct Gate {
    next_id: EventId,
    done: bool,
}

/// Fans one execution's events out to its log and live subscribers.
pub struct StreamWorker {
    execution_id: ExecutionId,
    store: Arc<dyn EventLogStore>,
    live: broadcast::Sender<StreamEvent>,
    gate: tokio::sync::Mutex<Gate>,
    status: Mutex<(ExecutionStatus, Option<EventId>)>,
    cancel: CancellationToken,
}

impl StreamWorker {
    pub fn new(execution_id: ExecutionId, store: Arc<dyn EventLogStore>, buffer: usize) -> Self {
        let (live, _) = broadcast::channel(buffer.max(1));
        Self {
            execution_id,
            store,
            live,
            gate: tokio::sync::Mutex::new(Gate {
                next_id: EventId(1),
                done: false,
            }),
            status: Mutex::new((ExecutionStatus::Running, None)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Token observed by the engine for this execution.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        info!(execution_id = %self.execution_id, "Cancellation requested");
        self.cancel.cancel();
    }

    fn status_lock(&self) -> Result<MutexGuard<'_, (ExecutionStatus, Option<EventId>)>> {
        self.status
            .lock()
            .map_err(|e| FlowlineError::Internal(format!("worker status lock poisoned: {}", e)))
    }

    /// Overall status and the id of the last event published.
    pub fn status(&self) -> Result<(ExecutionStatus, Option<EventId>)> {
        Ok(*self.status_lock()?)
    }

    pub fn is_done(&self) -> bool {
        self.status().map(|(s, _)| s.is_terminal()).unwrap_or(false)
    }

    /// Consume the engine's event channel until `Done` or until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<EventKind>) {
        debug!(execution_id = %self.execution_id, "Stream worker started");
        while let Some(kind) = events.recv().await {
            if self.publish(kind).await {
                break;
            }
        }
        debug!(execution_id = %self.execution_id, "Stream worker stopped");
    }

    /// Number, store and broadcast one event. Returns true once `Done` went out.
    ///
    /// An event the log refuses is never broadcast. The run is cancelled and
    /// ends with `Error` then `Done`, so no subscriber sees an event that a
    /// reconnect could not replay.
    pub async fn publish(&self, kind: EventKind) -> bool {
        let mut gate = self.gate.lock().await;
        if gate.done {
            warn!(
                execution_id = %self.execution_id,
                event = kind.event_type(),
                "Event after done dropped"
            );
            return true;
        }

        let event = StreamEvent::new(gate.next_id, kind);
        if let Err(e) = self.store.append(&self.execution_id, event.clone()).await {
            error!(
                execution_id = %self.execution_id,
                event = event.kind.event_type(),
                error = %e,
                "Failed to append event, failing execution"
            );
            self.cancel.cancel();
            self.fail(&mut gate, format!("event log write failed: {}", e)).await;
            return true;
        }
        self.deliver(&mut gate, event);
        gate.done
    }

    async fn fail(&self, gate: &mut Gate, reason: String) {
        let tail = [
            EventKind::Error { reason },
            EventKind::Done {
                execution_id: self.execution_id.to_string(),
                reason: DoneReason::Error,
            },
        ];
        for kind in tail {
            let event = StreamEvent::new(gate.next_id, kind);
            if let Err(e) = self.store.append(&self.execution_id, event.clone()).await {
                warn!(
                    execution_id = %self.execution_id,
                    event = event.kind.event_type(),
                    error = %e,
                    "Failure event not stored"
                );
            }
            self.deliver(gate, event);
        }
    }

    fn deliver(&self, gate: &mut Gate, event: StreamEvent) {
        let terminal = match &event.kind {
            EventKind::Done { reason, .. } => Some(*reason),
            _ => None,
        };
        gate.next_id = event.id.next();
        if let Ok(mut status) = self.status_lock() {
            status.1 = Some(event.id);
            if let Some(reason) = terminal {
                status.0 = match reason {
                    DoneReason::Completed => ExecutionStatus::Completed,
                    DoneReason::Cancel => ExecutionStatus::Cancelled,
                    DoneReason::Error => ExecutionStatus::Failed,
                };
            }
        }
        // No receivers is fine: nobody is attached right now.
        let _ = self.live.send(event);
        if terminal.is_some() {
            gate.done = true;
        }
    }

    /// Attach a subscriber resuming after `last_seen`.
    pub async fn subscribe(&self, last_seen: Option<EventId>) -> Result<Subscription> {
        let gate = self.gate.lock().await;
        let stored = self.store.get_or_create(&self.execution_id).await?;
        let history = log::replay(&stored.events, last_seen, gate.done);
        let live = (!gate.done).then(|| LiveFeed {
            rx: self.live.subscribe(),
            execution_id: self.execution_id.clone(),
            store: self.store.clone(),
        });
        debug!(
            execution_id = %self.execution_id,
            last_seen = ?last_seen,
            replayed = history.len(),
            live = live.is_some(),
            "Subscriber attached"
        );
        Ok(Subscription { history, live })
    }
}

/// Live workers by execution id.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<ExecutionId, Arc<StreamWorker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ExecutionId, Arc<StreamWorker>>>> {
        self.workers
            .lock()
            .map_err(|e| FlowlineError::Internal(format!("worker registry lock poisoned: {}", e)))
    }

    /// Register a worker. A duplicate id is an error.
    pub fn create(&self, worker: Arc<StreamWorker>) -> Result<()> {
        let mut workers = self.lock()?;
        let id = worker.execution_id().clone();
        if workers.contains_key(&id) {
            return Err(FlowlineError::DuplicateExecution(id.to_string()));
        }
        workers.insert(id, worker);
        Ok(())
    }

    pub fn get(&self, id: &ExecutionId) -> Option<Arc<StreamWorker>> {
        self.lock().ok()?.get(id).cloned()
    }

    pub fn remove(&self, id: &ExecutionId) -> Option<Arc<StreamWorker>> {
        self.lock().ok()?.remove(id)
    }

    pub fn list(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self
            .lock()
            .map(|w| w.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use futures::future::BoxFuture;
    use futures::StreamExt;

    use flowline_core::types::NodeStatus;

    use crate::log::EventLog;
    use crate::memory::MemoryEventLog;

    fn worker() -> Arc<StreamWorker> {
        worker_with_buffer(16)
    }

    fn worker_with_buffer(buffer: usize) -> Arc<StreamWorker> {
        let store = Arc::new(MemoryEventLog::new(Duration::seconds(60)));
        Arc::new(StreamWorker::new(ExecutionId::new(), store, buffer))
    }

    /// Memory log that refuses to store events of one type.
    struct RefusingLog {
        inner: MemoryEventLog,
        refuse: &'static str,
    }

    impl EventLogStore for RefusingLog {
        fn create(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<()>> {
            self.inner.create(execution_id)
        }

        fn get(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Option<EventLog>>> {
            self.inner.get(execution_id)
        }

        fn get_or_create(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<EventLog>> {
            self.inner.get_or_create(execution_id)
        }

        fn append(&self, execution_id: &ExecutionId, event: StreamEvent) -> BoxFuture<'_, Result<()>> {
            if event.kind.event_type() == self.refuse {
                return Box::pin(async { Err(FlowlineError::Database("disk full".into())) });
            }
            self.inner.append(execution_id, event)
        }

        fn delete(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<bool>> {
            self.inner.delete(execution_id)
        }

        fn list(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
            self.inner.list()
        }

        fn purge_expired(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
            self.inner.purge_expired()
        }
    }

    fn node(name: &str) -> EventKind {
        EventKind::NodeStart { node_id: name.into() }
    }

    fn done() -> EventKind {
        EventKind::Done {
            execution_id: "x".into(),
            reason: DoneReason::Completed,
        }
    }

    async fn ids(sub: Subscription) -> Vec<u64> {
        sub.into_stream().map(|e| e.id.0).collect().await
    }

    #[tokio::test]
    async fn test_ids_start_at_one() {
        let w = worker();
        w.publish(node("a")).await;
        w.publish(node("b")).await;
        let sub = w.subscribe(None).await.unwrap();
        let history: Vec<u64> = sub.history.iter().map(|e| e.id.0).collect();
        assert_eq!(history, vec![1, 2]);
        assert_eq!(w.status().unwrap(), (ExecutionStatus::Running, Some(EventId(2))));
    }

    #[tokio::test]
    async fn test_resume_then_live() {
        let w = worker();
        for name in ["a", "b", "c", "d", "e"] {
            w.publish(node(name)).await;
        }
        let sub = w.subscribe(Some(EventId(3))).await.unwrap();
        w.publish(node("f")).await;
        w.publish(done()).await;
        assert_eq!(ids(sub).await, vec![4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_live_stream_ends_at_done() {
        let w = worker();
        w.publish(node("a")).await;
        let sub = w.subscribe(None).await.unwrap();
        let reader = tokio::spawn(ids(sub));

        tokio::task::yield_now().await;
        w.publish(node("b")).await;
        tokio::task::yield_now().await;
        w.publish(done()).await;

        let got = tokio::time::timeout(std::time::Duration::from_secs(5), reader)
            .await
            .expect("live stream did not end after done")
            .unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_catches_up_from_log() {
        let w = worker_with_buffer(2);
        let sub = w.subscribe(None).await.unwrap();
        for name in ["a", "b", "c", "d", "e"] {
            w.publish(node(name)).await;
        }
        w.publish(done()).await;

        assert_eq!(ids(sub).await, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_refused_append_fails_the_run() {
        let store = Arc::new(RefusingLog {
            inner: MemoryEventLog::new(Duration::seconds(60)),
            refuse: "node_stop",
        });
        let w = Arc::new(StreamWorker::new(ExecutionId::new(), store, 16));
        let early = w.subscribe(None).await.unwrap();

        assert!(!w.publish(node("a")).await);
        let stop = EventKind::NodeStop {
            node_id: "a".into(),
            status: NodeStatus::Completed,
            result: serde_json::json!({}),
        };
        assert!(w.publish(stop).await);
        assert!(w.publish(node("late")).await);

        assert!(w.cancel_token().is_cancelled());
        assert_eq!(w.status().unwrap(), (ExecutionStatus::Failed, Some(EventId(3))));

        let sub = w.subscribe(None).await.unwrap();
        let kinds: Vec<&str> = sub.history.iter().map(|e| e.kind.event_type()).collect();
        assert_eq!(kinds, vec!["node_start", "error", "done"]);
        assert!(matches!(
            &sub.history[1].kind,
            EventKind::Error { reason } if reason.contains("disk full")
        ));
        assert_eq!(ids(early).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_finished_run_is_history_only() {
        let w = worker();
        w.publish(node("a")).await;
        w.publish(done()).await;
        let sub = w.subscribe(None).await.unwrap();
        assert!(sub.live.is_none());
        assert_eq!(ids(sub).await, vec![1, 2]);
        assert!(w.is_done());
        assert_eq!(w.status().unwrap().0, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_nothing_published_after_done() {
        let w = worker();
        assert!(w.publish(done()).await);
        assert!(w.publish(node("late")).await);
        let sub = w.subscribe(None).await.unwrap();
        assert_eq!(sub.history.len(), 1);
    }

    #[tokio::test]
    async fn test_run_consumes_channel() {
        let w = worker();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(w.clone().run(rx));
        tx.send(node("a")).unwrap();
        tx.send(done()).unwrap();
        task.await.unwrap();
        assert_eq!(w.status().unwrap(), (ExecutionStatus::Completed, Some(EventId(2))));
    }

    #[test]
    fn test_registry_create_once() {
        let registry = WorkerRegistry::new();
        let w = worker();
        let id = w.execution_id().clone();
        registry.create(w.clone()).unwrap();
        assert!(matches!(
            registry.create(w),
            Err(FlowlineError::DuplicateExecution(_))
        ));
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.list(), vec![id.clone()]);
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }
}
