//! Host binary for the demo pipeline: wires a [`jana_core::TopologyBuilder`]
//! around [`demo`]'s source/factory/processor, parses `-Pkey=value`
//! parameter overrides, installs the engine's signal handlers, and prints
//! a [`jana_core::FinalReport`] once the run quiesces.
//!
//! Deliberately thin (spec.md's Non-goals exclude a plugin loader and a
//! rich CLI grammar for this exercise): this binary exists to prove the
//! engine runs, not to be a general-purpose JANA launcher.

mod demo;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use jana_core::{AffinityPolicy, FinalReport, OutputLock, ParameterManager, ServiceRegistry, ThreadManager, TopologyBuilder};

/// SIGINT count at which the process gives up on a graceful quit and
/// exits immediately, per spec.md §6 "Signals".
const FORCE_EXIT_SIGINT_COUNT: usize = 6;

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jana_app=info,jana_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Split a `-Pkey=value` argument into its key/value, or `None` if it
/// doesn't match the grammar. A small hand-rolled parser rather than a
/// CLI derive crate: the only flag this binary accepts is `-P`, so a
/// framework would buy nothing (spec.md's Non-goals exclude a general CLI
/// grammar for this exercise).
fn parse_param_flag(arg: &str) -> Option<(&str, &str)> {
    let rest = arg.strip_prefix("-P")?;
    let (key, value) = rest.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

fn apply_cli_params(params: &ParameterManager) -> Result<()> {
    for arg in std::env::args().skip(1) {
        match parse_param_flag(&arg) {
            Some((key, value)) => {
                params
                    .set_raw(key, value.to_string())
                    .with_context(|| format!("setting parameter {key:?} from {arg:?}"))?;
            }
            None => {
                anyhow::bail!("unrecognised argument {arg:?} (expected -Pkey=value)");
            }
        }
    }
    Ok(())
}

/// Runs on its own thread for the run's lifetime, translating `SIGINT`,
/// `SIGUSR1`, and `SIGUSR2` into the engine actions spec.md §6 describes:
/// graceful quit (forced on the 6th `SIGINT`), an asynchronous status
/// dump, and a backtrace capture, respectively.
fn spawn_signal_thread(manager: Arc<ThreadManager>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGUSR1, SIGUSR2};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGUSR1, SIGUSR2])
        .context("installing SIGINT/SIGUSR1/SIGUSR2 handlers")?;

    std::thread::Builder::new()
        .name("jana-signals".to_string())
        .spawn(move || {
            let sigint_count = AtomicUsize::new(0);
            for signal in signals.forever() {
                match signal {
                    SIGINT => {
                        let count = sigint_count.fetch_add(1, Ordering::AcqRel) + 1;
                        tracing::warn!(count, "SIGINT received");
                        if count >= FORCE_EXIT_SIGINT_COUNT {
                            tracing::error!("repeated SIGINT, exiting immediately");
                            std::process::exit(130);
                        }
                        manager.quit();
                    }
                    SIGUSR1 => {
                        tracing::info!(
                            state = ?manager.state(),
                            ticks = manager.ticks(),
                            quiesced = manager.is_quiesced(),
                            "status dump (SIGUSR1)"
                        );
                    }
                    SIGUSR2 => {
                        let backtrace = std::backtrace::Backtrace::force_capture();
                        tracing::info!(%backtrace, "backtrace dump (SIGUSR2)");
                    }
                    _ => unreachable!("not registered above"),
                }
            }
        })
        .context("spawning signal-handling thread")?;

    Ok(())
}

/// Installs the `SIGSEGV` handler separately from the iterator-based ones
/// above: a segfault handler runs on the faulting thread itself and must
/// not return normally, so it cannot share the `Signals::forever` loop.
/// Emits a minimal report, then falls through to the platform's default
/// handling (spec.md §6, "caught to emit a report before default
/// handling").
fn install_segv_handler() -> Result<()> {
    // SAFETY: the handler only writes to stderr (not strictly
    // async-signal-safe but matches the original's best-effort report)
    // and then re-raises the default SIGSEGV disposition rather than
    // attempting to resume execution.
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGSEGV, || {
            eprintln!("\nFATAL: segmentation fault, aborting\n");
            let _ = signal_hook::low_level::emulate_default_handler(signal_hook::consts::SIGSEGV);
        })
        .context("installing SIGSEGV handler")?;
    }
    Ok(())
}

const DEFAULT_EVENT_COUNT: u64 = 1000;

fn main() -> Result<()> {
    init_tracing();
    install_segv_handler()?;

    let params = Arc::new(ParameterManager::new());
    apply_cli_params(&params)?;

    let event_count = params.register("DEMO:NEVENTS", DEFAULT_EVENT_COUNT as i64)? as u64;
    let worker_count = params.worker_count(num_cpus::get().max(1));

    let services = Arc::new(ServiceRegistry::new());
    services.register(Arc::new(OutputLock::new()));

    let counter = Arc::new(AtomicU64::new(0));
    let processor = Box::new(demo::CountingProcessor::new(
        Arc::clone(&counter),
        Arc::clone(&services),
    ));

    let topology = TopologyBuilder::new(Arc::clone(&params), worker_count, worker_count)
        .add_pipeline(
            "demo",
            demo::CountingSource::new(event_count),
            demo::catalog(),
            vec![],
            vec![processor],
        )
        .build();

    params.lock();

    tracing::info!(worker_count, event_count, "starting run");
    let manager = Arc::new(ThreadManager::new(
        &topology,
        worker_count,
        AffinityPolicy::CoreFill,
        Duration::from_micros(200),
    ));

    spawn_signal_thread(Arc::clone(&manager))?;

    let started = Instant::now();
    manager.run();

    while !manager.is_quiesced() && !manager.is_quitting() {
        std::thread::sleep(Duration::from_millis(5));
    }
    manager.stop_and_join();
    let elapsed = started.elapsed();

    let report = FinalReport::collect(&topology, elapsed);
    print!("{}", report.render());
    tracing::info!(events_counted = counter.load(Ordering::Acquire), "run complete");

    Ok(())
}
