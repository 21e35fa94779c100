//! JavaScript execution contexts (QuickJS)
//!
//! Provides the QuickJS implementation of the execution-context capability set via rquickjs.

mod convert;
mod runtime;

pub use convert::VALUE_UNPACKER_GLOBAL;
pub use runtime::{QuickJsContext, WorkletRuntimeObject};
