use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;

use flowline_core::error::Result;
use flowline_core::event::{DoneReason, EventKind, StreamEvent};
use flowline_core::types::{EventId, ExecutionId, ExecutionStatus};

/// Ordered record of one execution's events.
///
/// Expires `ttl` after creation, however often it is read.
#[derive(Debug, Clone)]
pub struct EventLog {
    pub execution_id: ExecutionId,
    pub events: Vec<StreamEvent>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    /// Set once `Done` has been appended.
    pub completed: bool,
}

impl EventLog {
    pub fn new(execution_id: ExecutionId, ttl: Duration) -> Self {
        Self {
            execution_id,
            events: Vec::new(),
            created_at: Utc::now(),
            ttl,
            completed: false,
        }
    }

    pub fn push(&mut self, event: StreamEvent) {
        if event.is_done() {
            self.completed = true;
        }
        self.events.push(event);
    }

    pub fn last_id(&self) -> Option<EventId> {
        self.events.last().map(|e| e.id)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.created_at + self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Terminal status, read from the final `Done`.
    pub fn final_status(&self) -> Option<ExecutionStatus> {
        self.events.iter().rev().find_map(|e| match e.kind {
            EventKind::Done { reason, .. } => Some(match reason {
                DoneReason::Completed => ExecutionStatus::Completed,
                DoneReason::Cancel => ExecutionStatus::Cancelled,
                DoneReason::Error => ExecutionStatus::Failed,
            }),
            _ => None,
        })
    }

    /// History to deliver to a client resuming after `last_seen`.
    pub fn replay(&self, last_seen: Option<EventId>) -> Vec<StreamEvent> {
        replay(&self.events, last_seen, self.completed)
    }
}

/// Resume rule shared by every backend.
///
/// Events strictly after `last_seen`, except that the whole history is
/// returned when `last_seen` is absent or unknown, or when nothing newer
/// exists yet and the run is still going.
pub fn replay(events: &[StreamEvent], last_seen: Option<EventId>, done: bool) -> Vec<StreamEvent> {
    let Some(last) = last_seen else {
        return events.to_vec();
    };
    let Some(pos) = events.iter().position(|e| e.id == last) else {
        return events.to_vec();
    };
    let newer = &events[pos + 1..];
    if newer.is_empty() && !done {
        return events.to_vec();
    }
    newer.to_vec()
}

/// Keyed store of event logs.
///
/// `create` fails on a duplicate id; `get` and `delete` are idempotent and
/// treat expired logs as absent.
pub trait EventLogStore: Send + Sync + 'static {
    fn create(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<()>>;

    fn get(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Option<EventLog>>>;

    /// Fetch the log, creating an empty one if none exists.
    fn get_or_create(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<EventLog>>;

    /// Append one event, creating the log on first use.
    fn append(&self, execution_id: &ExecutionId, event: StreamEvent) -> BoxFuture<'_, Result<()>>;

    /// Returns whether a log was removed.
    fn delete(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<bool>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>>;

    /// Drop every expired log. Returns the ids removed.
    fn purge_expired(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(n: u64) -> Vec<StreamEvent> {
        (1..=n)
            .map(|i| StreamEvent::new(EventId(i), EventKind::NodeStart { node_id: format!("n{}", i) }))
            .collect()
    }

    #[test]
    fn test_replay_without_id_is_full_history() {
        assert_eq!(replay(&events(3), None, false).len(), 3);
    }

    #[test]
    fn test_replay_after_known_id() {
        let got = replay(&events(5), Some(EventId(3)), false);
        let ids: Vec<u64> = got.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn test_replay_unknown_id_is_full_history() {
        assert_eq!(replay(&events(5), Some(EventId(42)), false).len(), 5);
        assert_eq!(replay(&events(5), Some(EventId(42)), true).len(), 5);
    }

    #[test]
    fn test_replay_caught_up() {
        // Still running: rebuild from scratch.
        assert_eq!(replay(&events(5), Some(EventId(5)), false).len(), 5);
        // Finished: nothing left to send.
        assert!(replay(&events(5), Some(EventId(5)), true).is_empty());
    }

    #[test]
    fn test_push_marks_completed() {
        let mut log = EventLog::new(ExecutionId::new(), Duration::seconds(60));
        log.push(StreamEvent::new(EventId(1), EventKind::Start { execution_id: "x".into() }));
        assert!(!log.completed);
        assert_eq!(log.final_status(), None);
        log.push(StreamEvent::new(
            EventId(2),
            EventKind::Done {
                execution_id: "x".into(),
                reason: DoneReason::Cancel,
            },
        ));
        assert!(log.completed);
        assert_eq!(log.last_id(), Some(EventId(2)));
        assert_eq!(log.final_status(), Some(ExecutionStatus::Cancelled));
    }

    #[test]
    fn test_expiry_is_measured_from_creation() {
        let log = EventLog::new(ExecutionId::new(), Duration::seconds(60));
        assert!(!log.is_expired());
        assert!(log.is_expired_at(log.created_at + Duration::seconds(60)));
    }
}
