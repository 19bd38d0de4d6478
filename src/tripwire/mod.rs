//! Tripwire: BLAKE3 hashing and the provenance event log.

pub mod eventlog;
pub mod hasher;
