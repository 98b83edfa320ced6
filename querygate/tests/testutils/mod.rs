//! Test utilities for QueryGate integration tests
//!
//! - fixture: engine wired to a manual clock, plus query builders
//! - flaky_store: backing store that can be switched off mid-test

pub mod fixture;
pub mod flaky_store;

/// Route `log` output through the test harness; safe to call repeatedly
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
