//! Runtime system
//!
//! The scheduler, futures, shared-memory contexts and the values they hold.

pub mod future;
pub mod memory;
pub mod scheduler;
pub mod shared;
pub mod value;
