//! Integration tests for the event pipeline.
//!
//! - `harness.rs`     - In-memory broker, scripted delivery handler
//! - `dead_letter.rs` - Failure path and retry-count progression
//! - `discard.rs`     - Malformed bodies and exhausted retries
//! - `redrive.rs`     - Moving dead letters back to work queues
//! - `resilience.rs`  - Broker outages and dead-letter publish failures

mod dead_letter;
pub(crate) mod harness;
mod redrive;
