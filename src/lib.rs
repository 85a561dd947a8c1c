//! Assistants engine: durable runs over a polled job queue, streamed model
//! calls compiled into a gapless event log, and built-in tool dispatch.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod runs;
pub mod store;
pub mod tools;
