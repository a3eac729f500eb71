//! Event logs, stream workers and the execution service.
//!
//! Every execution gets one `StreamWorker` that numbers the engine's events,
//! appends them to an `EventLogStore` and fans them out to subscribers.
//! `ExecutionService` ties compiler, engine and workers together behind
//! submit / subscribe / cancel.

use std::sync::Arc;

use flowline_core::config::{EventLogBackend, EventLogConfig, StreamConfig};
use flowline_core::error::Result;

pub mod log;
pub mod memory;
pub mod service;
pub mod source;
pub mod sqlite;
pub mod worker;

pub use log::{EventLog, EventLogStore};
pub use memory::MemoryEventLog;
pub use service::{ExecutionService, ExecutionSummary};
pub use source::DirSpecSource;
pub use sqlite::SqliteEventLog;
pub use worker::{EventStream, LiveFeed, StreamWorker, Subscription, WorkerRegistry};

/// Build the configured event log backend.
pub fn open_event_log(config: &EventLogConfig, stream: &StreamConfig) -> Result<Arc<dyn EventLogStore>> {
    let ttl = chrono::Duration::seconds(stream.event_ttl_secs as i64);
    Ok(match config.backend {
        EventLogBackend::Memory => Arc::new(MemoryEventLog::new(ttl)),
        EventLogBackend::Sqlite => Arc::new(SqliteEventLog::open(&config.resolved_path(), ttl)?),
    })
}
