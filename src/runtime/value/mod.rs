//! Publishable values
//!
//! This module provides `Value`, the object graph that can be flattened into a
//! shared-memory context block and read back by worker processes.

pub mod graph;
pub use graph::*;

#[cfg(test)]
mod tests;
