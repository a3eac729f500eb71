pub mod config;
pub mod error;
pub mod event;
pub mod spec;
pub mod sse;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowlineError, Result, ValidationIssue, ValidationReport};
pub use event::{DoneReason, EventKind, StreamEvent};
pub use types::*;
