//! Engine adapters
//!
//! Each adapter implements the `ExecutionContext` capability set for one script engine.

#[cfg(feature = "quickjs")]
pub mod js;
