//! Scheduling back onto the application's main context
//!
//! Worklet runtimes never touch the main context directly. Anything aimed at it
//! (worklets scheduled with `_scheduleOnJS`, fatal error reports) is posted to the
//! main queue through a [`JsScheduler`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, warn};

use crate::context::ExecutionContext;
use crate::error::{Result, WorkletsError};
use crate::queue::MessageQueueThread;
use crate::shareable::{Shareable, ShareableWorklet};

/// Fatal error record delivered to the host application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JsErrorRecord {
    pub message: String,
    pub stack: String,
    pub name: String,
    pub js_engine: String,
}

/// Error reporting policy registered by the host application
pub trait ErrorReporter: Send + Sync {
    /// Unrecoverable errors, e.g. a runtime whose bootstrap script failed
    fn report_fatal_error(&self, error: JsErrorRecord);

    /// Failures of work that has no caller left to propagate to (async worklets)
    fn report_error(&self, runtime_name: &str, error: &WorkletsError) {
        warn!(runtime_name = runtime_name, "Unhandled worklet error: {}", error);
    }
}

/// Default reporter: writes everything to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report_fatal_error(&self, record: JsErrorRecord) {
        if record.stack.is_empty() {
            error!("[{}] {}: {}", record.js_engine, record.name, record.message);
        } else {
            error!("[{}] {}: {}\n{}", record.js_engine, record.name, record.message, record.stack);
        }
    }
}

/// Posts work onto the main context's queue
pub struct JsScheduler {
    queue: Arc<dyn MessageQueueThread>,
    context: Option<Arc<dyn ExecutionContext>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl JsScheduler {
    /// Create a scheduler for the given main queue
    ///
    /// Without a main context only plain tasks and error reports can be scheduled.
    pub fn new(queue: Arc<dyn MessageQueueThread>) -> Self {
        Self {
            queue,
            context: None,
            reporter: Arc::new(LogErrorReporter),
        }
    }

    /// Bind the main execution context, driven by the scheduler's queue
    pub fn with_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueueThread> {
        &self.queue
    }

    pub fn context(&self) -> Option<&Arc<dyn ExecutionContext>> {
        self.context.as_ref()
    }

    pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.reporter
    }

    /// Post a plain task on the main queue
    pub fn schedule_on_js(&self, task: impl FnOnce() + Send + 'static) {
        self.queue.run_on_queue(Box::new(task));
    }

    /// Post a worklet call on the main context
    ///
    /// Failures inside the worklet go to the error reporter.
    ///
    /// # Errors
    /// Returns a configuration error if no main context is bound
    pub fn schedule_worklet_on_js(&self, worklet: ShareableWorklet, args: Vec<Shareable>) -> Result<()> {
        let context = self.context.clone().ok_or_else(|| {
            WorkletsError::Configuration("No main context bound to the JS scheduler".to_string())
        })?;
        let reporter = Arc::clone(&self.reporter);

        self.schedule_on_js(move || {
            let result = context
                .call_worklet(&worklet, &args)
                .and_then(|_| context.run_pending_jobs());
            if let Err(e) = result {
                reporter.report_error(context.name(), &e);
            }
        });
        Ok(())
    }

    /// Deliver a fatal error record on the main queue
    pub fn report_fatal_error_on_js(&self, record: JsErrorRecord) {
        let reporter = Arc::clone(&self.reporter);
        self.schedule_on_js(move || reporter.report_fatal_error(record));
    }

    /// Report a non-fatal error right away on the calling thread
    pub fn report_error(&self, runtime_name: &str, error: &WorkletsError) {
        self.reporter.report_error(runtime_name, error);
    }
}
