//! ProxyFS test & validation infrastructure.
//!
//! Shared harness for driving a lease manager from simulated mount
//! sessions, plus the end-to-end scenario suites for the lease protocol.

pub mod harness;
pub mod lease_properties;
pub mod lease_scenarios;

pub use harness::{fast_config, TestHarness};
