//! tasklane - CLI
//!
//! `tasklane worker` is the entry point of job worker processes; the
//! dispatcher starts it with the arena path and speaks length-prefixed
//! frames over its stdin/stdout. `tasklane demo` runs a small workload.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use tasklane::jobs::{serve, JobDispatcher, JobRegistry, JobRequest};
use tasklane::runtime::memory::SharedArena;
use tasklane::runtime::scheduler::Scheduler;
use tasklane::runtime::value::Value;
use tasklane::util::config::{load_config, load_default_config, RuntimeConfig};
use tasklane::util::logger::{self, LogLevel};
use tasklane::{Done, ErrorInfo, VERSION};

/// Cooperative tasks with out-of-process job workers
#[derive(Parser, Debug)]
#[command(name = "tasklane")]
#[command(version = VERSION)]
#[command(about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve jobs on stdin/stdout (started by the dispatcher)
    Worker {
        /// Shared arena file to map
        #[arg(long, value_name = "PATH")]
        arena: Option<PathBuf>,

        /// Worker index, for logs
        #[arg(long, default_value_t = 0)]
        id: usize,
    },

    /// Run a demo workload on a pool of worker processes
    Demo {
        /// Number of workers (overrides the config file)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Configuration file (defaults to $TASKLANE_CONFIG)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Worker { arena, id } => {
            logger::init_worker(args.log_level, id);
            run_worker(arena, id)
        }
        Commands::Demo { workers, config } => {
            logger::init_with_level(args.log_level);
            let mut config = match config {
                Some(path) => load_config(&path)
                    .with_context(|| format!("Failed to load config: {}", path.display()))?,
                None => load_default_config().context("Failed to load config")?,
            };
            if let Some(workers) = workers {
                config.jobs.workers = workers;
            }
            run_demo(config)
        }
    }
}

fn run_worker(
    arena: Option<PathBuf>,
    id: usize,
) -> Result<()> {
    let arena = match arena {
        Some(path) => Some(
            SharedArena::open(&path)
                .with_context(|| format!("Failed to open arena: {}", path.display()))?,
        ),
        None => None,
    };
    let registry = JobRegistry::with_builtins();
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(&registry, stdin.lock(), stdout.lock(), arena.as_ref(), id)
        .with_context(|| format!("Worker {id} failed"))?;
    Ok(())
}

fn run_demo(config: RuntimeConfig) -> Result<()> {
    let RuntimeConfig {
        scheduler,
        jobs,
        arena,
    } = config;
    let scheduler = Scheduler::new(scheduler);
    let summary = scheduler.run(move |cx| async move {
        let dispatcher = JobDispatcher::spawn(&cx, jobs, arena)
            .map_err(|e| ErrorInfo::new("spawn", e.to_string()))?;
        info!(workers = dispatcher.workers_count(), "demo started");

        let table = Value::map([
            ("primes", Value::Array([2, 3, 5, 7, 11, 13].map(Value::Int).to_vec())),
            ("answer", Value::Int(42)),
        ]);
        let ctx = dispatcher
            .contexts()
            .publish(&table)
            .map_err(|e| ErrorInfo::from_error(&e))?;

        let requests = vec![
            JobRequest::encode("sleep", &120u64).map_err(|e| ErrorInfo::from_error(&e))?,
            JobRequest::encode("sum", &(1..=100i64).collect::<Vec<_>>())
                .map_err(|e| ErrorInfo::from_error(&e))?,
            JobRequest::new("context_sum", Vec::new()).with_context(ctx),
            JobRequest::encode("fail", &"demo failure").map_err(|e| ErrorInfo::from_error(&e))?,
        ];
        let handles = dispatcher
            .start_multi(requests, Some(Duration::from_secs(5)))
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        // A fork that ticks while the jobs run.
        let ticker = cx.fork_named("ticker", |cx| async move {
            for _ in 0..3 {
                cx.sleep(Duration::from_millis(20)).await;
            }
            Ok(Done)
        })?;

        let queue = cx.wait_queue(handles.iter().map(|h| h.future().clone()))?;
        let mut lines = Vec::new();
        while let Some(done) = queue.next(None).await {
            let response = cx.wait_concurrently(&done).await?;
            let line = match response.error_kind() {
                Some(kind) => format!("job failed: {kind}"),
                None => match response.decode::<i64>() {
                    Ok(n) => format!("job result: {n}"),
                    Err(e) => format!("job result undecodable: {e}"),
                },
            };
            lines.push(line);
        }
        cx.wait_concurrently(&ticker).await?;
        Ok(lines)
    });

    let lines = summary.context("Demo failed")?;
    for line in lines {
        println!("{line}");
    }
    Ok(())
}
