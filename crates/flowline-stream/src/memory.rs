use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use tracing::debug;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::StreamEvent;
use flowline_core::types::ExecutionId;

use crate::log::{EventLog, EventLogStore};

/// Process-local event logs. Lost on restart.
pub struct MemoryEventLog {
    logs: Mutex<HashMap<ExecutionId, EventLog>>,
    ttl: Duration,
}

impl MemoryEventLog {
    pub fn new(ttl: Duration) -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ExecutionId, EventLog>>> {
        self.logs
            .lock()
            .map_err(|e| FlowlineError::Internal(format!("event log lock poisoned: {}", e)))
    }

    /// Live entry for `id`, evicting it first if it has expired.
    fn live<'a>(
        logs: &'a mut HashMap<ExecutionId, EventLog>,
        id: &ExecutionId,
    ) -> Option<&'a mut EventLog> {
        if logs.get(id).is_some_and(|log| log.is_expired()) {
            logs.remove(id);
            debug!(execution_id = %id, "Expired event log evicted");
        }
        logs.get_mut(id)
    }
}

impl EventLogStore for MemoryEventLog {
    fn create(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<()>> {
        let id = execution_id.clone();
        Box::pin(async move {
            let mut logs = self.lock()?;
            if Self::live(&mut logs, &id).is_some() {
                return Err(FlowlineError::DuplicateEventLog(id.to_string()));
            }
            logs.insert(id.clone(), EventLog::new(id, self.ttl));
            Ok(())
        })
    }

    fn get(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Option<EventLog>>> {
        let id = execution_id.clone();
        Box::pin(async move {
            let mut logs = self.lock()?;
            Ok(Self::live(&mut logs, &id).map(|log| log.clone()))
        })
    }

    fn get_or_create(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<EventLog>> {
        let id = execution_id.clone();
        Box::pin(async move {
            let mut logs = self.lock()?;
            if let Some(log) = Self::live(&mut logs, &id) {
                return Ok(log.clone());
            }
            let log = EventLog::new(id.clone(), self.ttl);
            logs.insert(id, log.clone());
            Ok(log)
        })
    }

    fn append(&self, execution_id: &ExecutionId, event: StreamEvent) -> BoxFuture<'_, Result<()>> {
        let id = execution_id.clone();
        Box::pin(async move {
            let mut logs = self.lock()?;
            if Self::live(&mut logs, &id).is_none() {
                logs.insert(id.clone(), EventLog::new(id.clone(), self.ttl));
            }
            if let Some(log) = logs.get_mut(&id) {
                log.push(event);
            }
            Ok(())
        })
    }

    fn delete(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<bool>> {
        let id = execution_id.clone();
        Box::pin(async move { Ok(self.lock()?.remove(&id).is_some()) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
        Box::pin(async move {
            let logs = self.lock()?;
            let mut ids: Vec<ExecutionId> = logs
                .values()
                .filter(|log| !log.is_expired())
                .map(|log| log.execution_id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut logs = self.lock()?;
            let expired: Vec<ExecutionId> = logs
                .values()
                .filter(|log| log.is_expired_at(now))
                .map(|log| log.execution_id.clone())
                .collect();
            for id in &expired {
                logs.remove(id);
            }
            Ok(expired)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::event::EventKind;
    use flowline_core::types::EventId;

    fn event(id: u64) -> StreamEvent {
        StreamEvent::new(EventId(id), EventKind::Ping { timestamp: 0 })
    }

    #[tokio::test]
    async fn test_create_is_create_once() {
        let store = MemoryEventLog::new(Duration::seconds(60));
        let id = ExecutionId::new();
        store.create(&id).await.unwrap();
        assert!(matches!(
            store.create(&id).await,
            Err(FlowlineError::DuplicateEventLog(_))
        ));
    }

    #[tokio::test]
    async fn test_append_creates_lazily() {
        let store = MemoryEventLog::new(Duration::seconds(60));
        let id = ExecutionId::new();
        store.append(&id, event(1)).await.unwrap();
        store.append(&id, event(2)).await.unwrap();
        let log = store.get(&id).await.unwrap().unwrap();
        assert_eq!(log.events.len(), 2);
        assert_eq!(store.list().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_get_and_delete_are_idempotent() {
        let store = MemoryEventLog::new(Duration::seconds(60));
        let id = ExecutionId::new();
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.delete(&id).await.unwrap());
        store.get_or_create(&id).await.unwrap();
        store.get_or_create(&id).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_logs_are_absent() {
        let store = MemoryEventLog::new(Duration::zero());
        let id = ExecutionId::new();
        store.create(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());

        store.append(&id, event(1)).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.purge_expired().await.unwrap(), vec![id]);
    }
}
