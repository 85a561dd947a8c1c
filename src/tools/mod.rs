//! Built-in tools: registry, execution, confirmation and the tool-step worker.

pub mod confirm;
pub mod dispatch;
pub mod executor;
pub mod registry;

pub use confirm::{Confirmer, poll_for_cancellation};
pub use dispatch::ToolStepWorker;
pub use executor::{ShellExecutor, ToolExecutor};
pub use registry::{BUILTIN_PREFIX, ToolKind, ToolRegistry};
