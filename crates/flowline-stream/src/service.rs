use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowline_core::config::StreamConfig;
use flowline_core::error::{FlowlineError, Result};
use flowline_core::spec::GraphSpec;
use flowline_core::traits::SpecSource;
use flowline_core::types::{EventId, ExecutionId, ExecutionStatus, Payload};
use flowline_engine::{drive, EventEmitter, ExecutionEngine, PrepareFuture};
use flowline_graph::GraphCompiler;

use crate::log::EventLogStore;
use crate::worker::{EventStream, StreamWorker, Subscription, WorkerRegistry};

/// Snapshot returned by `ExecutionService::status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub last_event_id: Option<EventId>,
}

/// Entry point for callers: submit, subscribe, cancel, status.
pub struct ExecutionService {
    compiler: GraphCompiler,
    engine: Arc<ExecutionEngine>,
    store: Arc<dyn EventLogStore>,
    registry: Arc<WorkerRegistry>,
    specs: Option<Arc<dyn SpecSource>>,
    config: StreamConfig,
}

impl ExecutionService {
    pub fn new(
        compiler: GraphCompiler,
        engine: Arc<ExecutionEngine>,
        store: Arc<dyn EventLogStore>,
        config: StreamConfig,
    ) -> Self {
        Self {
            compiler,
            engine,
            store,
            registry: Arc::new(WorkerRegistry::new()),
            specs: None,
            config,
        }
    }

    pub fn with_spec_source(mut self, specs: Arc<dyn SpecSource>) -> Self {
        self.specs = Some(specs);
        self
    }

    pub fn compiler(&self) -> &GraphCompiler {
        &self.compiler
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Compile `spec` and start running it in the background.
    ///
    /// Validation failures are returned here and never reach the stream.
    pub async fn submit(&self, spec: &GraphSpec, input: Payload) -> Result<ExecutionId> {
        let graph = Arc::new(self.compiler.compile(spec)?);
        self.launch(Box::pin(async move { Ok(graph) }), input).await
    }

    /// Start a run of a stored graph. Loading and compiling happen after the
    /// id is returned; failures there end the stream with `Error` and `Done`.
    pub async fn submit_from_source(&self, graph_id: &str, input: Payload) -> Result<ExecutionId> {
        let specs = self
            .specs
            .clone()
            .ok_or_else(|| FlowlineError::Config("no spec source configured".into()))?;
        let compiler = self.compiler.clone();
        let graph_id = graph_id.to_string();
        let prepare: PrepareFuture = Box::pin(async move {
            let spec = specs.load(&graph_id).await?;
            Ok(Arc::new(compiler.compile(&spec)?))
        });
        self.launch(prepare, input).await
    }

    async fn launch(&self, prepare: PrepareFuture, input: Payload) -> Result<ExecutionId> {
        let id = ExecutionId::new();
        self.store.create(&id).await?;

        let worker = Arc::new(StreamWorker::new(
            id.clone(),
            self.store.clone(),
            self.config.subscriber_buffer,
        ));
        self.registry.create(worker.clone())?;

        let ping = Duration::from_secs(self.config.ping_interval_secs);
        let (emitter, events) = EventEmitter::new(id.clone(), ping);
        tokio::spawn(worker.clone().run(events));

        let engine = self.engine.clone();
        let cancel = worker.cancel_token();
        tokio::spawn(async move {
            drive(emitter, prepare, engine, input, cancel).await;
        });

        info!(execution_id = %id, "Execution submitted");
        Ok(id)
    }

    /// Ordered events for `id`, resuming after `last_seen`.
    ///
    /// Runs still owned by a worker get history then live events; anything
    /// else found in the event log is replayed without a live feed.
    pub async fn subscribe(&self, id: &ExecutionId, last_seen: Option<EventId>) -> Result<EventStream> {
        if let Some(worker) = self.registry.get(id) {
            return Ok(worker.subscribe(last_seen).await?.into_stream());
        }
        match self.store.get(id).await? {
            Some(log) => {
                debug!(execution_id = %id, "Replaying stored history without a live worker");
                Ok(Subscription::history_only(log.replay(last_seen)).into_stream())
            }
            None => Err(FlowlineError::ExecutionNotFound(id.to_string())),
        }
    }

    /// Request cooperative cancellation. A finished run is left as is.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<()> {
        if let Some(worker) = self.registry.get(id) {
            if !worker.is_done() {
                worker.cancel();
            }
            return Ok(());
        }
        match self.store.get(id).await? {
            Some(_) => Ok(()),
            None => Err(FlowlineError::ExecutionNotFound(id.to_string())),
        }
    }

    pub async fn status(&self, id: &ExecutionId) -> Result<ExecutionSummary> {
        if let Some(worker) = self.registry.get(id) {
            let (status, last_event_id) = worker.status()?;
            return Ok(ExecutionSummary {
                execution_id: id.clone(),
                status,
                last_event_id,
            });
        }
        match self.store.get(id).await? {
            // A stored log with no live worker and no `Done` was interrupted.
            Some(log) => Ok(ExecutionSummary {
                execution_id: id.clone(),
                status: log.final_status().unwrap_or(ExecutionStatus::Failed),
                last_event_id: log.last_id(),
            }),
            None => Err(FlowlineError::ExecutionNotFound(id.to_string())),
        }
    }

    /// Drop expired logs and the finished workers that owned them.
    pub async fn purge_expired(&self) -> Result<usize> {
        let expired = self.store.purge_expired().await?;
        for id in &expired {
            if self.registry.get(id).is_some_and(|w| w.is_done()) {
                self.registry.remove(id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired executions purged");
        }
        Ok(expired.len())
    }

    /// Periodically purge expired executions until `cancel` fires.
    pub fn spawn_janitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let interval = Duration::from_secs(self.config.janitor_interval_secs.max(1));
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Event log janitor started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        info!("Event log janitor shutting down");
                        break;
                    }
                }
                if let Err(e) = service.purge_expired().await {
                    error!(error = %e, "Event log purge failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TtlDuration;
    use futures::StreamExt;
    use serde_json::json;

    use flowline_core::config::EngineConfig;
    use flowline_core::event::{DoneReason, EventKind, StreamEvent};
    use flowline_test_utils::{fixtures, payload, ScriptedModel, StaticSpecSource, Step};
    use flowline_tools::{FunctionRegistry, ToolRegistry};

    use crate::memory::MemoryEventLog;

    fn service_with(model: ScriptedModel, ttl: TtlDuration) -> ExecutionService {
        let compiler = GraphCompiler::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(FunctionRegistry::with_builtins()),
        );
        let engine = Arc::new(ExecutionEngine::new(Arc::new(model), EngineConfig::default()));
        let store = Arc::new(MemoryEventLog::new(ttl));
        ExecutionService::new(compiler, engine, store, StreamConfig::default())
    }

    fn service(model: ScriptedModel) -> ExecutionService {
        service_with(model, TtlDuration::seconds(3600))
    }

    async fn all_events(svc: &ExecutionService, id: &ExecutionId) -> Vec<StreamEvent> {
        svc.subscribe(id, None).await.unwrap().collect().await
    }

    async fn wait_done(svc: &ExecutionService, id: &ExecutionId) -> ExecutionStatus {
        loop {
            let status = svc.status(id).await.unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_and_stream_to_done() {
        let svc = service(ScriptedModel::new());
        let id = svc.submit(&fixtures::linear(), payload(json!({"message": "go"}))).await.unwrap();

        let events = all_events(&svc, &id).await;
        assert_eq!(events.first().map(|e| e.kind.event_type()), Some("start"));
        assert!(events.last().is_some_and(|e| e.is_done()));
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        let ids: Vec<u64> = events.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, (1..=events.len() as u64).collect::<Vec<_>>());
        assert_eq!(svc.status(&id).await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_subscribe_mid_run_ends_with_done() {
        let model = ScriptedModel::new().on("A", Step::delayed_json(Duration::from_millis(200), json!({})));
        let svc = service(model);
        let id = svc.submit(&fixtures::linear(), Payload::new()).await.unwrap();
        let stream = svc.subscribe(&id, None).await.unwrap();

        let events: Vec<StreamEvent> = tokio::time::timeout(Duration::from_secs(10), stream.collect())
            .await
            .expect("live stream did not end after done");
        assert!(events.last().is_some_and(|e| e.is_done()));
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        assert_eq!(svc.status(&id).await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_validation_error_is_synchronous() {
        let svc = service(ScriptedModel::new());
        let mut spec = fixtures::linear();
        spec.entry_point = "nope".into();
        let err = svc.submit(&spec, Payload::new()).await.unwrap_err();
        assert!(matches!(err, FlowlineError::Validation(_)));
        assert!(svc.registry().is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let svc = service(ScriptedModel::new());
        let id = svc.submit(&fixtures::linear(), Payload::new()).await.unwrap();
        wait_done(&svc, &id).await;

        let first: Vec<StreamEvent> = svc.subscribe(&id, Some(EventId(3))).await.unwrap().collect().await;
        let second: Vec<StreamEvent> = svc.subscribe(&id, Some(EventId(3))).await.unwrap().collect().await;
        assert_eq!(first, second);
        assert_eq!(first[0].id, EventId(4));

        let unknown: Vec<StreamEvent> = svc.subscribe(&id, Some(EventId(999))).await.unwrap().collect().await;
        assert_eq!(unknown, all_events(&svc, &id).await);
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let svc = service(ScriptedModel::new());
        let id = ExecutionId::new();
        assert!(matches!(
            svc.subscribe(&id, None).await,
            Err(FlowlineError::ExecutionNotFound(_))
        ));
        assert!(svc.cancel(&id).await.is_err());
        assert!(svc.status(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let svc = service(ScriptedModel::new().on("A", Step::Hang));
        let id = svc.submit(&fixtures::linear(), Payload::new()).await.unwrap();
        let stream = svc.subscribe(&id, None).await.unwrap();
        svc.cancel(&id).await.unwrap();

        let events: Vec<StreamEvent> = stream.collect().await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.event_type()).collect();
        assert_eq!(kinds[kinds.len() - 2..], ["cancel", "done"]);
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(EventKind::Done { reason: DoneReason::Cancel, .. })
        ));
        assert_eq!(svc.status(&id).await.unwrap().status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_disconnect_does_not_cancel() {
        let model = ScriptedModel::new().on("A", Step::delayed_json(Duration::from_millis(50), json!({})));
        let svc = service(model);
        let id = svc.submit(&fixtures::linear(), Payload::new()).await.unwrap();
        let stream = svc.subscribe(&id, None).await.unwrap();
        drop(stream);

        assert_eq!(wait_done(&svc, &id).await, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_source_failure_is_streamed() {
        let svc = service(ScriptedModel::new())
            .with_spec_source(Arc::new(StaticSpecSource::new().with("linear", fixtures::linear())));

        let id = svc.submit_from_source("missing", Payload::new()).await.unwrap();
        let kinds: Vec<&str> = all_events(&svc, &id)
            .await
            .iter()
            .map(|e| e.kind.event_type())
            .collect();
        assert_eq!(kinds, vec!["start", "error", "done"]);

        let id = svc.submit_from_source("linear", Payload::new()).await.unwrap();
        assert_eq!(wait_done(&svc, &id).await, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_purge_drops_finished_executions() {
        let svc = service_with(ScriptedModel::new(), TtlDuration::zero());
        let id = svc.submit(&fixtures::linear(), Payload::new()).await.unwrap();
        wait_done(&svc, &id).await;

        assert!(svc.purge_expired().await.unwrap() >= 1);
        assert!(svc.registry().get(&id).is_none());
        assert!(matches!(
            svc.status(&id).await,
            Err(FlowlineError::ExecutionNotFound(_))
        ));
    }
}
