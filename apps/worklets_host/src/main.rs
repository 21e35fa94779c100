use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::{Level, debug, error, info, warn};

use worklets::{
    CapabilityProxy, DispatchThread, EngineKind, ErrorReporter, ExecutionContext, JsErrorRecord,
    JsScheduler, MessageQueueThread, RuntimeMutex, Shareable, ShareableWorklet, WorkletRuntime,
    WorkletsError, install_value_unpacker, make_context,
};
use worklets_log::{LogConfig, LogStream, init_logging, parse_level};

mod config;
use config::{ConfigError, HostConfig, TaskConfig, TaskMode};

const VERSION: &str = "0.1.0";

/// Get default config path based on executable location
fn default_config_path() -> String {
    env::current_exe()
        .ok()
        .and_then(|exe_path| {
            let stem = exe_path.file_stem()?;
            let parent = exe_path.parent()?;
            Some(parent.join(stem).with_extension("json"))
        })
        .and_then(|path| path.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "./worklets_host.json".to_string())
}

/// Worklets Host - runs worklet tasks on isolated script runtimes
#[derive(Parser, Debug)]
#[command(name = "worklets_host")]
#[command(version = VERSION)]
#[command(about = "Creates worklet runtimes from a JSON configuration and runs tasks on them", long_about = None)]
struct Args {
    /// Path to configuration file (JSON)
    #[arg(short, long, env = "WORKLETS_HOST_CONFIG", default_value_t = default_config_path())]
    config: String,

    /// Enable logging to file (worklets_host.log in current directory)
    #[arg(long, env = "WORKLETS_LOG_FILE")]
    log_file: bool,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    print_schema: bool,
}

#[derive(Error, Debug)]
enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Worklets(#[from] WorkletsError),

    #[error("Failed to spawn dispatch thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Collects everything the runtimes report while tasks run
#[derive(Default)]
struct HostErrorReporter {
    fatal: Mutex<Vec<JsErrorRecord>>,
    async_failures: AtomicUsize,
}

impl HostErrorReporter {
    fn fatal_errors(&self) -> Vec<JsErrorRecord> {
        match self.fatal.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ErrorReporter for HostErrorReporter {
    fn report_fatal_error(&self, record: JsErrorRecord) {
        error!("[{}] {}: {}", record.js_engine, record.name, record.message);
        match self.fatal.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    fn report_error(&self, runtime_name: &str, error: &WorkletsError) {
        warn!(runtime_name = runtime_name, "Async worklet failed: {}", error);
        self.async_failures.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
struct TaskOutcome {
    index: usize,
    runtime: String,
    mode: TaskMode,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    tasks: Vec<TaskOutcome>,
    fatal_errors: Vec<JsErrorRecord>,
    async_failures: usize,
}

impl RunSummary {
    fn failed(&self) -> bool {
        !self.fatal_errors.is_empty()
            || self.async_failures > 0
            || self.tasks.iter().any(|t| t.error.is_some())
    }
}

fn task_worklet(index: usize, task: &TaskConfig) -> ShareableWorklet {
    task.closure.iter().fold(
        ShareableWorklet::new(task.code.as_str()).with_location(format!("task #{}", index)),
        |worklet, (name, value)| worklet.with_closure_var(name.clone(), Shareable::from(value.clone())),
    )
}

fn run_task(index: usize, task: &TaskConfig, runtime: &Arc<WorkletRuntime>) -> TaskOutcome {
    let worklet = task_worklet(index, task);
    let mut outcome = TaskOutcome {
        index,
        runtime: task.runtime.clone(),
        mode: task.mode,
        status: "scheduled",
        result: None,
        error: None,
    };

    match task.mode {
        TaskMode::Sync => match runtime.execute_sync(&Shareable::worklet(worklet)) {
            Ok(value) => {
                debug!("Task #{} on '{}' returned {}", index, task.runtime, value);
                outcome.status = "ok";
                outcome.result = Some(value.to_json());
            }
            Err(e) => {
                warn!("Task #{} on '{}' failed: {}", index, task.runtime, e);
                outcome.status = "error";
                outcome.error = Some(e.to_string());
            }
        },
        TaskMode::Async => runtime.run_async_guarded(worklet),
    }
    outcome
}

/// Create every runtime, run every task and wait for queued work to drain
///
/// # Arguments
/// * `config` - Validated host configuration
/// * `base_dir` - Directory bootstrap files are resolved against
fn run(config: &HostConfig, base_dir: &Path) -> Result<RunSummary, HostError> {
    let main_queue: Arc<dyn MessageQueueThread> = Arc::new(DispatchThread::spawn("worklets-main")?);
    let main_mutex = Arc::new(RuntimeMutex::new(()));
    let main_context: Arc<dyn ExecutionContext> =
        make_context(EngineKind::default(), "main", true, &main_mutex)?;
    install_value_unpacker(main_context.as_ref())?;

    let reporter = Arc::new(HostErrorReporter::default());
    let reporter_dyn: Arc<dyn ErrorReporter> = reporter.clone();
    let scheduler = Arc::new(
        JsScheduler::new(main_queue.clone())
            .with_context(main_context.clone())
            .with_error_reporter(reporter_dyn),
    );

    let capability_proxy = config
        .capabilities
        .iter()
        .fold(CapabilityProxy::new().with_value("hostVersion", VERSION), |proxy, (name, value)| {
            proxy.with_value(name.clone(), Shareable::from(value.clone()))
        })
        .into_host_object();

    let mut runtimes: BTreeMap<String, Arc<WorkletRuntime>> = BTreeMap::new();
    for entry in &config.runtimes {
        let runtime_config = entry.to_runtime_config(base_dir)?;
        let home_queue: Arc<dyn MessageQueueThread> =
            Arc::new(DispatchThread::spawn(format!("worklets-{}", entry.name))?);
        let runtime = WorkletRuntime::new(
            runtime_config,
            capability_proxy.clone(),
            home_queue,
            scheduler.clone(),
        )?;
        info!("Created {}", runtime);
        runtimes.insert(entry.name.clone(), runtime);
    }

    // Every runtime can reach the others through __runtimes
    let handles = Shareable::object(runtimes.iter().map(|(name, runtime)| (name.clone(), runtime.handle())));
    for runtime in runtimes.values() {
        runtime.context().set_global("__runtimes", &handles, true)?;
    }

    let mut tasks = Vec::with_capacity(config.tasks.len());
    for (index, task) in config.tasks.iter().enumerate() {
        let Some(runtime) = runtimes.get(&task.runtime) else {
            return Err(ConfigError::Invalid(format!("Unknown runtime '{}'", task.runtime)).into());
        };
        tasks.push(run_task(index, task, runtime));
    }

    // Async tasks first, then whatever they scheduled back onto the main context
    for runtime in runtimes.values() {
        runtime.home_queue().run_on_queue_sync(Box::new(|| {}));
    }
    main_queue.run_on_queue_sync(Box::new(|| {}));

    let summary = RunSummary {
        tasks,
        fatal_errors: reporter.fatal_errors(),
        async_failures: reporter.async_failures.load(Ordering::SeqCst),
    };

    drop(runtimes);
    main_queue.quit_synchronous();
    Ok(summary)
}

fn main() {
    let args = Args::parse();

    if args.print_schema {
        match serde_json::to_string_pretty(&HostConfig::schema()) {
            Ok(schema) => println!("{}", schema),
            Err(e) => {
                eprintln!("Failed to render schema: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // We can't log errors yet, so we use eprintln! for early failures
    let config = match HostConfig::from_json_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config from '{}': {}", args.config, e);
            std::process::exit(1);
        }
    };

    let log_level = parse_level(&config.log_level).unwrap_or_else(|| {
        eprintln!("Warning: Invalid log level '{}', using INFO", config.log_level);
        Level::INFO
    });

    // stdout carries the run summary
    let log_config = LogConfig::<std::fs::File>::new("worklets_host::")
        .with_level(log_level)
        .with_stream(LogStream::Stderr);
    let log_config = if args.log_file {
        match std::fs::File::create("worklets_host.log") {
            Ok(file) => log_config.with_log_file(file),
            Err(e) => {
                eprintln!("Unable to create worklets_host.log: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        log_config
    };

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("Worklets Host v{}", VERSION);
    info!("Configuration: {}", args.config);
    debug!("  Runtimes: {}", config.runtimes.len());
    debug!("  Tasks: {}", config.tasks.len());

    let base_dir = Path::new(&args.config)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let summary = match run(&config, &base_dir) {
        Ok(summary) => summary,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            error!("Failed to render results: {}", e);
            std::process::exit(1);
        }
    }

    if summary.failed() {
        std::process::exit(2);
    }
}
