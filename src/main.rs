use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use llama_cli_pool::worker::{ProcessWorker, SharedWorker};
use llama_cli_pool::{AppConfig, PromptOptions, TaskScheduler};

/// Run prompts through a pool of llama-cli processes.
#[derive(Parser, Debug)]
#[command(name = "llama_pool", version)]
struct Cli {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the llama-cli executable
    #[arg(long = "exe")]
    executable: Option<PathBuf>,

    /// Model file passed as `-m`
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Number of inference processes
    #[arg(long)]
    workers: Option<usize>,

    /// Scheduler threads (default: hardware parallelism)
    #[arg(long)]
    threads: Option<usize>,

    /// Echo completions while they are generated
    #[arg(long)]
    stream: bool,

    /// Per-prompt timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Wait this long for each child's start-up banner before prompting
    #[arg(long)]
    ready_timeout_ms: Option<u64>,

    /// off, error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Prompts to run. Read from stdin, one per line, when empty.
    prompts: Vec<String>,
}

fn setup_logging(log_dir: &str, level: LevelFilter) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = format!("{log_dir}/{timestamp}.log");

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}",
        )))
        .build(log_path)?;
    let stderr_appender = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{l} - {m}{n}")))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("stderr", Box::new(stderr_appender)))
        .build(
            Root::builder()
                .appender("file")
                .appender("stderr")
                .build(level),
        )?;

    log4rs::init_config(config)?;
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    if let Some(exe) = &cli.executable {
        config.worker.executable = exe.clone();
    }
    if let Some(model) = &cli.model {
        config.worker.model_path = model.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }
    if cli.stream {
        config.worker.stream_output = true;
    }
    if cli.timeout_ms.is_some() {
        config.worker.prompt_timeout_ms = cli.timeout_ms;
    }
    if config.workers == 0 {
        bail!("at least one worker is required");
    }
    Ok(config)
}

fn read_prompts(cli: &Cli) -> Result<Vec<String>> {
    if !cli.prompts.is_empty() {
        return Ok(cli.prompts.clone());
    }
    let mut prompts = Vec::new();
    for line in io::stdin().lock().lines() {
        let line = line.context("reading prompts from stdin")?;
        if !line.trim().is_empty() {
            prompts.push(line);
        }
    }
    Ok(prompts)
}

fn spawn_workers(config: &AppConfig, ready_timeout: Option<Duration>) -> Result<Vec<SharedWorker>> {
    let mut workers = Vec::with_capacity(config.workers);
    for index in 0..config.workers {
        let mut worker = ProcessWorker::spawn(config.worker.clone())
            .with_context(|| format!("starting worker #{index}"))?;
        if let Some(timeout) = ready_timeout {
            let banner = worker.wait_until_ready(timeout)?;
            if !banner.is_complete() {
                warn!(
                    "[MAIN] Worker #{index} (pid={}) not at its prompt after {timeout:?}: {:?}",
                    worker.pid(),
                    banner.termination
                );
            }
        }
        workers.push(Arc::new(Mutex::new(worker)));
    }
    Ok(workers)
}

fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let level = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    if let Err(e) = setup_logging(&config.log_dir, level) {
        eprintln!("Failed to set up logging: {e}");
    }

    let prompts = read_prompts(&cli)?;
    if prompts.is_empty() {
        warn!("[MAIN] No prompts given, nothing to do");
        return Ok(());
    }

    let workers = spawn_workers(&config, cli.ready_timeout_ms.map(Duration::from_millis))?;
    let scheduler = match config.threads {
        Some(n) => TaskScheduler::new(n)?,
        None => TaskScheduler::with_default_threads()?,
    };
    info!(
        "[MAIN] {} prompts across {} workers on {} threads",
        prompts.len(),
        workers.len(),
        scheduler.thread_count()
    );

    let stream = config.worker.stream_output;
    let mut handles = Vec::with_capacity(prompts.len());
    for (index, prompt) in prompts.into_iter().enumerate() {
        let worker = Arc::clone(&workers[index % workers.len()]);
        let handle = scheduler.submit(move || {
            let mut guard = worker.lock().unwrap_or_else(PoisonError::into_inner);
            let mut stdout = io::stdout();
            let options = if stream {
                PromptOptions::default().stream_to(&mut stdout)
            } else {
                PromptOptions::default()
            };
            guard.prompt_with(&prompt, options)
        })?;
        handles.push(handle);
    }

    let mut failures = 0usize;
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.wait() {
            Ok(Ok(output)) => {
                if !output.is_complete() {
                    warn!("[MAIN] Prompt #{index} ended early: {:?}", output.termination);
                }
                if !stream {
                    println!("[{index}] {}", output.text.trim());
                }
            }
            Ok(Err(e)) => {
                failures += 1;
                error!("[MAIN] Prompt #{index} failed: {e}");
            }
            Err(e) => {
                failures += 1;
                error!("[MAIN] Prompt #{index} task failed: {e}");
            }
        }
    }

    scheduler.shutdown();
    drop(workers);

    if failures > 0 {
        bail!("{failures} prompt(s) failed");
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
