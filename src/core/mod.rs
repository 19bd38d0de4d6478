//! Filter side: typed intents, resolution, compilation and the gate.

pub mod canonical;
pub mod compiler;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod gate;
pub mod parser;
pub mod pipeline;
pub mod resolver;
pub mod token;
pub mod types;
