//! Single ordered outlet for an execution's events.
//!
//! Every event of a run goes through one unbounded channel. A keepalive task
//! injects `Ping` when nothing was emitted for one interval. `finish` stops
//! and joins the keepalive before sending `Done`, and consumes the emitter,
//! so a run can only finish once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use flowline_core::event::{DoneReason, EventKind};
use flowline_core::types::ExecutionId;

/// Cloneable sender side, used by the engine loop.
#[derive(Clone)]
pub struct EmitHandle {
    tx: mpsc::UnboundedSender<EventKind>,
    activity: Arc<Activity>,
}

struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::SeqCst);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::SeqCst))
    }
}

impl EmitHandle {
    pub fn emit(&self, event: EventKind) {
        debug!(event = event.event_type(), "Emitting event");
        if self.tx.send(event).is_err() {
            debug!("Event consumer gone, event dropped");
        }
        self.activity.touch();
    }
}

/// Owner of a run's event channel.
pub struct EventEmitter {
    execution_id: ExecutionId,
    handle: EmitHandle,
    keepalive: Option<(CancellationToken, JoinHandle<()>)>,
}

impl EventEmitter {
    /// Create the emitter and start its keepalive. A zero interval disables pings.
    pub fn new(
        execution_id: ExecutionId,
        ping_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<EventKind>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = Arc::new(Activity {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        });
        let handle = EmitHandle { tx, activity };

        let keepalive = (!ping_interval.is_zero()).then(|| {
            let stop = CancellationToken::new();
            let task = tokio::spawn(keepalive(handle.clone(), ping_interval, stop.clone()));
            (stop, task)
        });

        (
            Self {
                execution_id,
                handle,
                keepalive,
            },
            rx,
        )
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn handle(&self) -> EmitHandle {
        self.handle.clone()
    }

    pub fn emit(&self, event: EventKind) {
        self.handle.emit(event);
    }

    /// Stop the keepalive, then emit the terminal `Done`.
    pub async fn finish(mut self, reason: DoneReason) {
        if let Some((stop, task)) = self.keepalive.take() {
            stop.cancel();
            if let Err(e) = task.await {
                debug!(error = %e, "Keepalive task ended abnormally");
            }
        }
        self.handle.emit(EventKind::Done {
            execution_id: self.execution_id.to_string(),
            reason,
        });
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        if let Some((stop, task)) = self.keepalive.take() {
            stop.cancel();
            task.abort();
        }
    }
}

async fn keepalive(handle: EmitHandle, interval: Duration, stop: CancellationToken) {
    loop {
        let due = handle.activity.last() + interval;
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(due) => {
                // Something may have been emitted while we slept.
                if Instant::now() >= handle.activity.last() + interval {
                    handle.emit(EventKind::Ping {
                        timestamp: chrono::Utc::now().timestamp(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::UnboundedReceiver<EventKind>) -> Vec<EventKind> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = ev.is_done();
            out.push(ev);
            if done {
                break;
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_only_when_idle() {
        let (emitter, mut rx) = EventEmitter::new(ExecutionId::new(), Duration::from_secs(15));
        tokio::time::sleep(Duration::from_secs(10)).await;
        emitter.emit(EventKind::Error { reason: "x".into() });
        // 10s after the last event: still quiet.
        tokio::time::sleep(Duration::from_secs(10)).await;
        // 35s mark: one ping 15s after the event at 10s.
        tokio::time::sleep(Duration::from_secs(15)).await;
        emitter.finish(DoneReason::Error).await;

        let events = drain(&mut rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["error", "ping", "done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_after_done() {
        let (emitter, mut rx) = EventEmitter::new(ExecutionId::new(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        emitter.finish(DoneReason::Completed).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let events = drain(&mut rx).await;
        assert!(events.last().is_some_and(|e| e.is_done()));
        assert!(events[..events.len() - 1].iter().all(|e| e.is_ping()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_pings() {
        let (emitter, mut rx) = EventEmitter::new(ExecutionId::new(), Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(60)).await;
        emitter.finish(DoneReason::Cancel).await;
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 1);
    }
}
