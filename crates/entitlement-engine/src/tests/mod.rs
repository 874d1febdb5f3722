//! Scenario tests for the entitlement engine.
//!
//! - `harness.rs`       - Mock backend, recording messenger, flaky store, harness
//! - `acquisition.rs`   - Token resolution: cache, refresh, rotation races, scanning
//! - `transitions.rs`   - Check outcomes, persistence, intervals, notices
//! - `broadcast.rs`     - Coalesced checks and deduplicated publishes
//! - `cross_process.rs` - Several contexts on one store
//! - `scanner.rs`       - External session recovery across tabs
//! - `runtime.rs`       - Event loop start, ticks and shutdown

mod runtime;
mod scanner;
