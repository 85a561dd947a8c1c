//! Runs: the data model, the state machine worker, the streaming compiler
//! and the operations the API calls.

pub mod compiler;
pub mod events;
pub mod machine;
pub mod model;
pub mod ops;
pub mod state;

pub use events::{EventName, EventPayload, RunEvent};
pub use machine::RunWorker;
pub use model::{Assistant, Message, Run, RunStep, Thread};
pub use ops::RunService;
pub use state::{MessageStatus, RunStatus, StepStatus, SystemStatus};
