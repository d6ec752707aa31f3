//! Integration tests for the tracking hub.
//!
//! - `harness.rs`        - Shared broker, instances and viewer helpers
//! - `fanout.rs`         - Local broadcast exactness and backpressure
//! - `forwarder.rs`      - One forwarder per active key, under concurrency
//! - `cross_instance.rs` - Delivery across instances sharing a broker
//! - `heartbeat.rs`      - Silent viewers are dropped in bounded time, once
//! - `reconnect.rs`      - Forwarders survive broker outages
//! - `shutdown.rs`       - Registry teardown

mod cross_instance;
