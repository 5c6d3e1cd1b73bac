//! Integration and property test suite for the shoal snapshot engine.
//!
//! The harness wires the engine to an in-process state bus and in-memory
//! repositories, so whole snapshot lifecycles run deterministically inside a
//! single test function.

pub mod harness;

#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod proptest_executor;

pub use harness::{Captured, TestCluster, LOCAL_NODE};
