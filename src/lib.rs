//! Detent: deterministic filter compilation and crash-safe batch execution.
//!
//! Typed filter intents are resolved against a canonical dictionary and
//! compiled to parameterized predicates; raw query text is refused. Selected
//! rows run through a durable per-row state machine with exactly-once
//! side effects, startup recovery and a write-back queue.

pub mod batch;
pub mod cli;
pub mod core;
pub mod gateway;
pub mod tripwire;
