use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod admission;
mod config;
mod engine;
mod error;
mod mapping;
mod monitor;
mod request;
mod stats;
mod throughput_log;
mod volume;
mod worker;

use admission::AdmissionState;
use config::{CacheMode, Config, TunerConstants};
use engine::ReadEngine;
use mapping::MappingLayer;
use monitor::AdaptiveMonitor;
use stats::{snapshot, EngineStats, StatsReporter};
use throughput_log::ThroughputLog;
use volume::{fixed_latency, SimServer, SimVolumeClient};
use worker::DeviceWorker;

#[derive(Parser)]
#[command(name = "mf-cache-sim")]
#[command(about = "Multi-factor cache/core hybrid benchmarking engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark against the multi-factor engine.
    Run {
        /// Cache mode: pt, wa, wb, wt, mfwa, mfwb, mfwt.
        #[arg(short = 'M', long, default_value = "mfwa")]
        mode: String,

        /// Path to the cache device's Unix-domain socket. A loopback
        /// simulated device is started automatically if omitted.
        #[arg(long)]
        cache_socket: Option<PathBuf>,

        /// Path to the core device's Unix-domain socket. A loopback
        /// simulated device is started automatically if omitted.
        #[arg(long)]
        core_socket: Option<PathBuf>,

        /// Block size in bytes.
        #[arg(short = 'b', long, default_value = "4096")]
        block_size: u32,

        /// Number of submitter threads generating read requests.
        #[arg(short = 't', long)]
        threads: Option<usize>,

        /// Benchmark duration in seconds.
        #[arg(short = 'd', long, default_value = "10")]
        duration: u64,

        /// Enable the adaptive monitor (load_admit hill-climbing).
        #[arg(short = 'm', long)]
        monitor: bool,

        /// Address-space size in cache lines, for the synthetic workload.
        #[arg(long, default_value = "256")]
        working_set_lines: u64,
    },
    /// List the simulated volumes this binary knows how to attach to.
    List,
    /// Print resolved configuration and monitor tuning constants.
    Info {
        #[arg(short = 'M', long, default_value = "mfwa")]
        mode: String,
    },
}

// The hot request path (the engine, the device workers, the monitor)
// runs entirely on native `std::thread`s with no `.await` points; `main`
// stays on a `tokio` runtime only because that's the teacher binary's
// own idiom for its CLI entry point, and the stats-reporting subcommands
// are trivially synchronous work riding along on it.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            mode,
            cache_socket,
            core_socket,
            block_size,
            threads,
            duration,
            monitor,
            working_set_lines,
        } => {
            let cache_mode: CacheMode = mode.parse().map_err(anyhow::Error::msg)?;
            let mut config = Config {
                cache_mode,
                block_size,
                worker_threads: threads.unwrap_or_else(num_cpus::get),
                duration_secs: duration,
                enable_monitor: monitor,
                ..Config::default()
            };
            if let Some(path) = cache_socket {
                config.cache_socket_path = path.to_string_lossy().into_owned();
            }
            if let Some(path) = core_socket {
                config.core_socket_path = path.to_string_lossy().into_owned();
            }

            run_benchmark(config, working_set_lines)?;
        }
        Commands::List => list_devices(),
        Commands::Info { mode } => {
            let cache_mode: CacheMode = mode.parse().map_err(anyhow::Error::msg)?;
            show_info(cache_mode);
        }
    }

    Ok(())
}

/// Owns every long-running piece of a benchmark run: the two simulated
/// devices (started in-process unless real sockets were given), their
/// submission workers and throughput logs, the engine, and (optionally)
/// the adaptive monitor and statistics reporter. Mirrors the design
/// notes' recommendation that detached threads become tasks owned by an
/// explicit host struct rather than fire-and-forget.
struct CacheInstance {
    engine: Arc<ReadEngine>,
    stats: Arc<EngineStats>,
    cache_log: Arc<ThroughputLog>,
    core_log: Arc<ThroughputLog>,
    monitor: Option<Arc<AdaptiveMonitor>>,
    monitor_handle: Option<std::thread::JoinHandle<()>>,
    // Kept alive only when we started loopback simulated devices
    // ourselves; dropping these tears the sockets down.
    _owned_cache_server: Option<SimServer>,
    _owned_core_server: Option<SimServer>,
}

impl CacheInstance {
    fn start(config: &Config) -> anyhow::Result<Self> {
        let mut owned_cache_server = None;
        let mut owned_core_server = None;

        if !std::path::Path::new(&config.cache_socket_path).exists() {
            owned_cache_server = Some(SimServer::start(
                &config.cache_socket_path,
                config.transfer_data,
                fixed_latency(200),
            )?);
        }
        if !std::path::Path::new(&config.core_socket_path).exists() {
            owned_core_server = Some(SimServer::start(
                &config.core_socket_path,
                config.transfer_data,
                fixed_latency(800),
            )?);
        }

        let cache_client = Arc::new(SimVolumeClient::connect(&config.cache_socket_path, config.transfer_data)?);
        let core_client = Arc::new(SimVolumeClient::connect(&config.core_socket_path, config.transfer_data)?);

        let cache_log = Arc::new(ThroughputLog::new(config.tuner.log_capacity));
        let core_log = Arc::new(ThroughputLog::new(config.tuner.log_capacity));

        let cache_worker = Arc::new(DeviceWorker::spawn("cache", cache_client, cache_log.clone()));
        let core_worker = Arc::new(DeviceWorker::spawn("core", core_client, core_log.clone()));

        let mapping = Arc::new(MappingLayer::new(config.block_size as u64, 4));
        let admission = Arc::new(AdmissionState::new());
        let stats = EngineStats::new();

        let engine = ReadEngine::new(
            config.cache_mode,
            mapping,
            admission.clone(),
            stats.clone(),
            cache_worker,
            core_worker,
        );

        let (monitor, monitor_handle) = if config.enable_monitor && config.cache_mode.is_multi_factor() {
            let monitor = Arc::new(AdaptiveMonitor::new(
                admission,
                stats.clone(),
                cache_log.clone(),
                core_log.clone(),
                config.tuner,
            ));
            let handle = Arc::clone(&monitor).spawn();
            (Some(monitor), Some(handle))
        } else {
            (None, None)
        };

        Ok(CacheInstance {
            engine,
            stats,
            cache_log,
            core_log,
            monitor,
            monitor_handle,
            _owned_cache_server: owned_cache_server,
            _owned_core_server: owned_core_server,
        })
    }

    fn shutdown(mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(handle) = self.monitor_handle.take() {
            let _ = handle.join();
        }
        // `self.engine`'s device-worker `Arc`s drop here; `DeviceWorker`'s
        // own `Drop` impl stops and joins each worker thread.
    }
}

fn run_benchmark(config: Config, working_set_lines: u64) -> anyhow::Result<()> {
    info!(
        mode = %config.cache_mode,
        block_size = config.block_size,
        threads = config.worker_threads,
        duration = config.duration_secs,
        "starting benchmark"
    );

    let instance = Arc::new(CacheInstance::start(&config)?);
    let reporter = StatsReporter::spawn(
        instance.stats.clone(),
        instance.cache_log.clone(),
        instance.core_log.clone(),
        Duration::from_millis(500),
    );

    let should_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(config.worker_threads + 1));
    let mut handles = Vec::with_capacity(config.worker_threads);

    for worker_id in 0..config.worker_threads {
        let instance = instance.clone();
        let should_stop = should_stop.clone();
        let barrier = barrier.clone();
        let block_size = config.block_size;

        handles.push(
            std::thread::Builder::new()
                .name(format!("submitter-{worker_id}"))
                .spawn(move || {
                    barrier.wait();
                    let mut rng_state: u64 = 0x9e37_79b9_7f4a_7c15 ^ (worker_id as u64);
                    while !should_stop.load(Ordering::Relaxed) {
                        rng_state ^= rng_state << 13;
                        rng_state ^= rng_state >> 7;
                        rng_state ^= rng_state << 17;
                        let line = rng_state % working_set_lines.max(1);
                        let addr = line * block_size as u64;

                        let (tx, rx) = std::sync::mpsc::channel();
                        instance.engine.read(
                            addr,
                            block_size,
                            Box::new(move |result| {
                                let _ = tx.send(result);
                            }),
                        );
                        let _ = rx.recv_timeout(Duration::from_secs(5));
                    }
                })?,
        );
    }

    barrier.wait();
    let started_at = Instant::now();
    std::thread::sleep(Duration::from_secs(config.duration_secs));
    should_stop.store(true, Ordering::Relaxed);

    for handle in handles {
        let _ = handle.join();
    }

    let report = snapshot(&instance.stats, &instance.cache_log, &instance.core_log, started_at, 500.0);
    println!("{report:#?}");

    reporter.stop();
    Arc::try_unwrap(instance)
        .unwrap_or_else(|_| panic!("submitter threads should have released their CacheInstance handle"))
        .shutdown();

    Ok(())
}

fn list_devices() {
    println!("configured volumes:");
    println!("  cache  (simulated SSD, loopback Unix-domain socket unless --cache-socket is given)");
    println!("  core   (simulated SSD, loopback Unix-domain socket unless --core-socket is given)");
}

fn show_info(cache_mode: CacheMode) {
    let config = Config {
        cache_mode,
        ..Config::default()
    };
    println!("cache mode:       {}", config.cache_mode);
    println!("multi-factor:     {}", config.cache_mode.is_multi_factor());
    println!("block size:       {} bytes", config.block_size);
    println!("queue depth:      {}", config.queue_depth);
    println!("worker threads:   {}", config.worker_threads);
    println!("cache socket:     {}", config.cache_socket_path);
    println!("core socket:      {}", config.core_socket_path);
    println!("monitor enabled:  {}", config.enable_monitor);
    println!();
    print_tuner(&config.tuner);
}

fn print_tuner(tuner: &TunerConstants) {
    println!("monitor tuning constants:");
    println!("  wait_stable_threshold          = {}", tuner.wait_stable_threshold);
    println!("  wait_stable_sleep_interval_us  = {}", tuner.wait_stable_sleep_interval_us);
    println!("  workload_change_threshold      = {}", tuner.workload_change_threshold);
    println!("  load_admit_tuning_step         = {}", tuner.load_admit_tuning_step);
    println!("  measure_throughput_interval_us = {}", tuner.measure_throughput_interval_us);
    println!("  log_capacity                   = {}", tuner.log_capacity);
}
