//! Integration test crate for peerlink nodes.
//!
//! This crate exists solely to run tests that start several nodes over
//! loopback TCP. It has no public API - all functionality is in the test
//! modules.

#![forbid(unsafe_code)]
