use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventKind, StreamEvent};
use flowline_core::types::{EventId, ExecutionId};

use crate::log::{EventLog, EventLogStore};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS event_logs (
        execution_id TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        ttl_secs INTEGER NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS events (
        execution_id TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (execution_id, event_id)
    );

    CREATE INDEX IF NOT EXISTS idx_event_logs_created ON event_logs(created_at);";

fn db_err(e: rusqlite::Error) -> FlowlineError {
    FlowlineError::Database(e.to_string())
}

/// Log header as stored: creation time in unix millis and TTL in seconds.
struct Header {
    created_at: i64,
    ttl_secs: i64,
    completed: bool,
}

impl Header {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.created_at + self.ttl_secs * 1000
    }
}

/// SQLite-backed event logs. Survive restarts and can be replayed later.
///
/// Every query runs on the blocking pool so a slow disk never stalls the
/// runtime threads that drive executions.
pub struct SqliteEventLog {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
}

impl SqliteEventLog {
    /// Open or create the database at `path`.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowlineError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Event log database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(ttl: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
        })
    }

    /// Run `f` against the locked connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, Duration) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let ttl = self.ttl;
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| FlowlineError::Database(format!("connection lock poisoned: {}", e)))?;
            f(&mut conn, ttl)
        })
        .await
        .map_err(|e| FlowlineError::Database(format!("database task failed: {}", e)))?
    }

    fn header(conn: &Connection, id: &ExecutionId) -> Result<Option<Header>> {
        conn.query_row(
            "SELECT created_at, ttl_secs, completed FROM event_logs WHERE execution_id = ?1",
            params![id.as_str()],
            |row| {
                Ok(Header {
                    created_at: row.get(0)?,
                    ttl_secs: row.get(1)?,
                    completed: row.get::<_, i64>(2)? != 0,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    /// Header of a live log, removing it first if it has expired.
    fn live_header(conn: &Connection, id: &ExecutionId) -> Result<Option<Header>> {
        match Self::header(conn, id)? {
            Some(h) if h.is_expired_at(Utc::now()) => {
                Self::remove(conn, id)?;
                debug!(execution_id = %id, "Expired event log evicted");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn insert_header(conn: &Connection, id: &ExecutionId, ttl: Duration) -> Result<Header> {
        let header = Header {
            created_at: Utc::now().timestamp_millis(),
            ttl_secs: ttl.num_seconds(),
            completed: false,
        };
        conn.execute(
            "INSERT INTO event_logs (execution_id, created_at, ttl_secs, completed) VALUES (?1, ?2, ?3, 0)",
            params![id.as_str(), header.created_at, header.ttl_secs],
        )
        .map_err(db_err)?;
        Ok(header)
    }

    fn remove(conn: &Connection, id: &ExecutionId) -> Result<bool> {
        conn.execute("DELETE FROM events WHERE execution_id = ?1", params![id.as_str()])
            .map_err(db_err)?;
        let removed = conn
            .execute("DELETE FROM event_logs WHERE execution_id = ?1", params![id.as_str()])
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    fn load(conn: &Connection, id: &ExecutionId, header: Header) -> Result<EventLog> {
        let mut stmt = conn
            .prepare(
                "SELECT event_id, event_type, data FROM events
                 WHERE execution_id = ?1 ORDER BY event_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                let event_id: i64 = row.get(0)?;
                let event_type: String = row.get(1)?;
                let data: String = row.get(2)?;
                Ok((event_id, event_type, data))
            })
            .map_err(db_err)?;

        let mut events = Vec::new();
        for row in rows {
            let (event_id, event_type, data) = row.map_err(db_err)?;
            let kind = EventKind::from_parts(&event_type, serde_json::from_str(&data)?)?;
            events.push(StreamEvent::new(EventId(event_id as u64), kind));
        }

        let created_at = DateTime::from_timestamp_millis(header.created_at).unwrap_or_else(Utc::now);
        Ok(EventLog {
            execution_id: id.clone(),
            events,
            created_at,
            ttl: Duration::seconds(header.ttl_secs),
            completed: header.completed,
        })
    }

    fn ids_where(conn: &Connection, sql: &str, now: i64) -> Result<Vec<ExecutionId>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![now], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(ExecutionId(row.map_err(db_err)?));
        }
        Ok(ids)
    }
}

impl EventLogStore for SqliteEventLog {
    fn create(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<()>> {
        let id = execution_id.clone();
        Box::pin(self.with_conn(move |conn, ttl| {
            if Self::live_header(conn, &id)?.is_some() {
                return Err(FlowlineError::DuplicateEventLog(id.to_string()));
            }
            Self::insert_header(conn, &id, ttl)?;
            Ok(())
        }))
    }

    fn get(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<Option<EventLog>>> {
        let id = execution_id.clone();
        Box::pin(self.with_conn(move |conn, _| match Self::live_header(conn, &id)? {
            Some(header) => Ok(Some(Self::load(conn, &id, header)?)),
            None => Ok(None),
        }))
    }

    fn get_or_create(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<EventLog>> {
        let id = execution_id.clone();
        Box::pin(self.with_conn(move |conn, ttl| {
            let header = match Self::live_header(conn, &id)? {
                Some(header) => header,
                None => Self::insert_header(conn, &id, ttl)?,
            };
            Self::load(conn, &id, header)
        }))
    }

    fn append(&self, execution_id: &ExecutionId, event: StreamEvent) -> BoxFuture<'_, Result<()>> {
        let id = execution_id.clone();
        Box::pin(self.with_conn(move |conn, ttl| {
            let data = serde_json::to_string(&event.kind.data())?;
            if Self::live_header(conn, &id)?.is_none() {
                Self::insert_header(conn, &id, ttl)?;
            }

            let tx = conn.transaction().map_err(db_err)?;
            tx.execute(
                "INSERT INTO events (execution_id, event_id, event_type, data) VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), event.id.0 as i64, event.kind.event_type(), data],
            )
            .map_err(db_err)?;
            if event.is_done() {
                tx.execute(
                    "UPDATE event_logs SET completed = 1 WHERE execution_id = ?1",
                    params![id.as_str()],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)
        }))
    }

    fn delete(&self, execution_id: &ExecutionId) -> BoxFuture<'_, Result<bool>> {
        let id = execution_id.clone();
        Box::pin(self.with_conn(move |conn, _| Self::remove(conn, &id)))
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
        Box::pin(self.with_conn(|conn, _| {
            Self::ids_where(
                conn,
                "SELECT execution_id FROM event_logs
                 WHERE created_at + ttl_secs * 1000 > ?1 ORDER BY execution_id",
                Utc::now().timestamp_millis(),
            )
        }))
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<Vec<ExecutionId>>> {
        Box::pin(self.with_conn(|conn, _| {
            let tx = conn.transaction().map_err(db_err)?;
            let expired = Self::ids_where(
                &tx,
                "SELECT execution_id FROM event_logs
                 WHERE created_at + ttl_secs * 1000 <= ?1 ORDER BY execution_id",
                Utc::now().timestamp_millis(),
            )?;
            for id in &expired {
                Self::remove(&tx, id)?;
            }
            tx.commit().map_err(db_err)?;
            if !expired.is_empty() {
                debug!(count = expired.len(), "Purged expired event logs");
            }
            Ok(expired)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::event::DoneReason;

    fn start(id: u64) -> StreamEvent {
        StreamEvent::new(EventId(id), EventKind::Start { execution_id: "e".into() })
    }

    fn done(id: u64) -> StreamEvent {
        StreamEvent::new(
            EventId(id),
            EventKind::Done {
                execution_id: "e".into(),
                reason: DoneReason::Completed,
            },
        )
    }

    #[tokio::test]
    async fn test_append_and_reload() {
        let store = SqliteEventLog::in_memory(Duration::seconds(60)).unwrap();
        let id = ExecutionId::new();
        store.create(&id).await.unwrap();
        store.append(&id, start(1)).await.unwrap();
        store
            .append(&id, StreamEvent::new(EventId(2), EventKind::NodeStart { node_id: "A".into() }))
            .await
            .unwrap();
        store.append(&id, done(3)).await.unwrap();

        let log = store.get(&id).await.unwrap().unwrap();
        assert!(log.completed);
        assert_eq!(log.events.len(), 3);
        assert_eq!(log.events[1].kind, EventKind::NodeStart { node_id: "A".into() });
        assert_eq!(log.last_id(), Some(EventId(3)));
    }

    #[tokio::test]
    async fn test_create_once_and_idempotent_delete() {
        let store = SqliteEventLog::in_memory(Duration::seconds(60)).unwrap();
        let id = ExecutionId::new();
        store.create(&id).await.unwrap();
        assert!(matches!(
            store.create(&id).await,
            Err(FlowlineError::DuplicateEventLog(_))
        ));
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let id = ExecutionId::new();
        {
            let store = SqliteEventLog::open(&path, Duration::seconds(60)).unwrap();
            store.append(&id, start(1)).await.unwrap();
            store.append(&id, done(2)).await.unwrap();
        }
        let store = SqliteEventLog::open(&path, Duration::seconds(60)).unwrap();
        let log = store.get_or_create(&id).await.unwrap();
        assert_eq!(log.events.len(), 2);
        assert!(log.completed);
        assert_eq!(store.list().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = SqliteEventLog::in_memory(Duration::zero()).unwrap();
        let id = ExecutionId::new();
        store.append(&id, start(1)).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.purge_expired().await.unwrap(), vec![id.clone()]);
        assert!(store.purge_expired().await.unwrap().is_empty());
    }
}
