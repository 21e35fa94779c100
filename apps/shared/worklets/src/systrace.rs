//! Tracing hook for platform profilers
//!
//! A host can install one [`TraceHook`] per process. Sections are always mirrored
//! as `tracing` spans, the hook only adds to that.

use std::sync::{Arc, OnceLock};

use tracing::span::EnteredSpan;

pub trait TraceHook: Send + Sync {
    fn begin_section(&self, name: &str);

    fn end_section(&self, name: &str);
}

static TRACE_HOOK: OnceLock<Arc<dyn TraceHook>> = OnceLock::new();

/// Install the process trace hook
///
/// Returns false if a hook was already installed.
pub fn set_trace_hook(hook: Arc<dyn TraceHook>) -> bool {
    TRACE_HOOK.set(hook).is_ok()
}

/// Open trace section, closed on drop
pub struct TraceSection {
    name: &'static str,
    hook: Option<&'static Arc<dyn TraceHook>>,
    _span: EnteredSpan,
}

impl TraceSection {
    pub fn begin(name: &'static str, runtime_name: &str) -> Self {
        let span = tracing::trace_span!("worklets", section = name, runtime_name = runtime_name).entered();
        let hook = TRACE_HOOK.get();
        if let Some(hook) = hook {
            hook.begin_section(name);
        }
        Self {
            name,
            hook,
            _span: span,
        }
    }
}

impl Drop for TraceSection {
    fn drop(&mut self) {
        if let Some(hook) = self.hook {
            hook.end_section(self.name);
        }
    }
}
