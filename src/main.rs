use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use nfq_firewall::config::Config;
use nfq_firewall::engine::{StaticDecider, WorkerPool};
use nfq_firewall::interception::Interceptor;
use nfq_firewall::monitor::Monitor;
use nfq_firewall::queue::nfqueue;

const MAIN_TICK: Duration = Duration::from_millis(200);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // the handler only touches an atomic
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[derive(Parser, Debug)]
#[command(name = "nfq-firewall", about = "NFQUEUE packet verdict daemon")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "NFQ_FIREWALL_CONFIG")]
    config: Option<PathBuf>,

    /// Queue number to bind, repeatable. Replaces the configured list.
    #[arg(short = 'q', long = "queue")]
    queues: Vec<u16>,

    /// Log filter, e.g. "info" or "nfq_firewall=trace"
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

fn load_config(args: Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if !args.queues.is_empty() {
        config.queues = args.queues;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;
    Ok(config)
}

fn run(config: Config) -> anyhow::Result<()> {
    let marks = config.mark_table()?;

    let mut queues = Vec::with_capacity(config.queues.len());
    for &queue_num in &config.queues {
        queues.push(nfqueue::open_queue(queue_num, config.nfq_options(), marks.clone())?);
    }

    install_signal_handlers();

    let pool = WorkerPool::spawn(
        config.workers,
        config.worker_backlog,
        Arc::new(StaticDecider::new(config.default_action)),
    );

    let mut readers = Vec::with_capacity(queues.len());
    for queue in &queues {
        let sender = pool.sender().context("worker pool already stopped")?;
        let interceptor = Interceptor::new(queue.clone(), sender, config.decode_failure_action);
        let handle = thread::Builder::new()
            .name(format!("nfqueue-{}", queue.id()))
            .spawn(move || {
                let result = interceptor.run(&SHUTDOWN);
                if result.is_err() {
                    SHUTDOWN.store(true, Ordering::SeqCst);
                }
                result
            })?;
        readers.push(handle);
    }

    info!(
        queues = ?config.queues,
        default_action = %config.default_action,
        decode_failure_action = %config.decode_failure_action,
        "nfq-firewall running"
    );

    let mut monitor = config
        .report_interval()
        .map(|interval| Monitor::new("nfqueue", queues.clone(), interval));

    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(MAIN_TICK);
        if let Some(monitor) = monitor.as_mut() {
            monitor.check_and_report();
        }
    }

    info!("shutting down");

    // readers first so no new gates appear, then let the workers resolve
    // what is queued, then drain and close the kernel queues
    for reader in readers {
        match reader.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "interception failed"),
            Err(_) => error!("interception thread panicked"),
        }
    }
    pool.shutdown();

    let mut failed = false;
    for queue in &queues {
        if let Err(e) = queue.close() {
            error!(error = %e, "failed to close queue");
            failed = true;
        }
    }
    if failed {
        anyhow::bail!("not all queues closed cleanly");
    }

    info!("bye");
    Ok(())
}

fn main() {
    let args = Args::parse();
    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nfq-firewall: {e:#}");
            std::process::exit(2);
        }
    };

    init_logging(&config.log_level);

    if let Err(e) = run(config) {
        error!("{e:#}");
        std::process::exit(1);
    }
}
