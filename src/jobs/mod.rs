//! Job queue protocol, wake/ready trigger, worker loop and retention.

pub mod cleanup;
pub mod completion;
pub mod model;
pub mod poller;
pub mod queue;
pub mod trigger;

pub use poller::{JobHandler, spawn_worker};
pub use queue::JobKind;
pub use trigger::{ChannelTrigger, NoopTrigger, ReadySignal, Trigger, Triggers};
