//! Whole-run lifecycle: `Start`, graph preparation, the engine run, and
//! exactly one `Done`.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use flowline_core::error::Result;
use flowline_core::event::{DoneReason, EventKind};
use flowline_core::types::Payload;
use flowline_graph::CompiledGraph;

use crate::emitter::EventEmitter;
use crate::engine::{ExecutionEngine, RunOutcome};

/// Future yielding the graph to run, e.g. a spec-source load plus compile.
pub type PrepareFuture = BoxFuture<'static, Result<Arc<CompiledGraph>>>;

/// Run one execution end to end and return the reason carried by `Done`.
///
/// The run itself happens on its own task so a panic anywhere in it still
/// ends the stream with `Error` and `Done`.
pub async fn drive(
    emitter: EventEmitter,
    prepare: PrepareFuture,
    engine: Arc<ExecutionEngine>,
    input: Payload,
    cancel: CancellationToken,
) -> DoneReason {
    let execution_id = emitter.execution_id().clone();
    emitter.emit(EventKind::Start {
        execution_id: execution_id.to_string(),
    });

    let handle = emitter.handle();
    let run_id = execution_id.clone();
    let task = tokio::spawn(async move {
        let graph = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.emit(EventKind::Cancel {
                    reason: "cancelled before start".into(),
                });
                return Ok(RunOutcome::Cancelled);
            }
            graph = prepare => graph?,
        };
        engine.run(graph, run_id, input, handle, cancel).await
    });

    let reason = match task.await {
        Ok(Ok(RunOutcome::Completed)) => DoneReason::Completed,
        Ok(Ok(RunOutcome::Cancelled)) => DoneReason::Cancel,
        Ok(Err(e)) => {
            error!(execution_id = %execution_id, error = %e, "Execution failed");
            emitter.emit(EventKind::Error {
                reason: e.to_string(),
            });
            DoneReason::Error
        }
        Err(e) => {
            error!(execution_id = %execution_id, error = %e, "Execution task aborted");
            emitter.emit(EventKind::Error {
                reason: format!("execution task failed: {}", e),
            });
            DoneReason::Error
        }
    };

    info!(execution_id = %execution_id, reason = ?reason, "Execution done");
    emitter.finish(reason).await;
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use flowline_core::config::EngineConfig;
    use flowline_core::error::FlowlineError;
    use flowline_core::types::ExecutionId;
    use flowline_graph::GraphCompiler;
    use flowline_test_utils::{fixtures, ScriptedModel, Step};
    use flowline_tools::{FunctionRegistry, ToolRegistry};
    use tokio::sync::mpsc;

    fn prepared(spec: flowline_core::spec::GraphSpec) -> PrepareFuture {
        Box::pin(async move {
            let compiler = GraphCompiler::new(
                Arc::new(ToolRegistry::new()),
                Arc::new(FunctionRegistry::with_builtins()),
            );
            Ok(Arc::new(compiler.compile(&spec)?))
        })
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<EventKind>) -> Vec<EventKind> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn engine(model: ScriptedModel) -> Arc<ExecutionEngine> {
        Arc::new(ExecutionEngine::new(Arc::new(model), EngineConfig::default()))
    }

    #[tokio::test]
    async fn test_start_first_done_last() {
        let (emitter, rx) = EventEmitter::new(ExecutionId::new(), Duration::from_secs(15));
        let reason = drive(
            emitter,
            prepared(fixtures::linear()),
            engine(ScriptedModel::new()),
            Payload::new(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(reason, DoneReason::Completed);
        let events = collect(rx).await;
        assert!(matches!(events.first(), Some(EventKind::Start { .. })));
        assert!(matches!(
            events.last(),
            Some(EventKind::Done { reason: DoneReason::Completed, .. })
        ));
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        assert_eq!(events[events.len() - 2].event_type(), "result");
    }

    #[tokio::test]
    async fn test_failure_reports_error_then_done() {
        let (emitter, rx) = EventEmitter::new(ExecutionId::new(), Duration::ZERO);
        let model = ScriptedModel::new().on("A", Step::Fail("upstream down".into()));
        let reason = drive(
            emitter,
            prepared(fixtures::linear()),
            engine(model),
            Payload::new(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(reason, DoneReason::Error);
        let events = collect(rx).await;
        let tail: Vec<&str> = events[events.len() - 2..].iter().map(|e| e.event_type()).collect();
        assert_eq!(tail, vec!["error", "done"]);
        match &events[events.len() - 2] {
            EventKind::Error { reason } => assert!(reason.contains("upstream down")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prepare_failure_still_completes_stream() {
        let (emitter, rx) = EventEmitter::new(ExecutionId::new(), Duration::ZERO);
        let prepare: PrepareFuture =
            Box::pin(async { Err(FlowlineError::SpecNotFound("missing".into())) });
        let reason = drive(
            emitter,
            prepare,
            engine(ScriptedModel::new()),
            Payload::new(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(reason, DoneReason::Error);
        let kinds: Vec<&str> = collect(rx).await.iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["start", "error", "done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_emits_cancel_then_done() {
        let (emitter, rx) = EventEmitter::new(ExecutionId::new(), Duration::from_secs(1));
        let model = ScriptedModel::new().on("A", Step::Hang);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let reason = drive(emitter, prepared(fixtures::linear()), engine(model), Payload::new(), cancel).await;

        assert_eq!(reason, DoneReason::Cancel);
        let events = collect(rx).await;
        let kinds: Vec<&str> = events
            .iter()
            .filter(|e| !e.is_ping())
            .map(|e| e.event_type())
            .collect();
        assert_eq!(kinds, vec!["start", "node_start", "cancel", "done"]);
        assert!(events.iter().any(|e| e.is_ping()));
        assert!(events.last().is_some_and(|e| e.is_done()));
    }
}
