pub mod driver;
pub mod emitter;
pub mod engine;
pub mod handoff;
pub mod state;

pub use driver::{drive, PrepareFuture};
pub use emitter::{EmitHandle, EventEmitter};
pub use engine::{ExecutionEngine, RunOutcome};
pub use state::{ExecutionState, NodeOutput, NodeSlot};
