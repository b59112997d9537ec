// Priority pipeline binary.
//
// `serve` runs the controller behind the HTTP control API and the snapshot stream until Ctrl+C.
// `simulate` runs one complete session in the foreground and prints the final statistics.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use priority_pipeline::config::AppConfig;
use priority_pipeline::controller::{StopReport, SystemController, SystemStatus};
use priority_pipeline::events::WorkerRole;
use priority_pipeline::server::{self, AppState, SnapshotPublisher};
use priority_pipeline::WorkerTiming;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STATUS_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(
    name = "priority-pipeline",
    about = "Bounded priority buffer with producer and consumer worker pools",
    version,
    long_about = None
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control API and the live snapshot stream
    Serve {
        /// Control API bind address
        #[arg(long)]
        bind: Option<String>,

        /// Snapshot stream bind address
        #[arg(long)]
        stream_bind: Option<String>,

        /// Milliseconds between snapshot lines
        #[arg(long)]
        stream_interval_ms: Option<u64>,
    },

    /// Run one session to completion and print final statistics
    Simulate {
        #[command(flatten)]
        system: SystemArgs,

        /// Seconds to wait for consumers to drain the buffer after producers finish
        #[arg(long, default_value = "30")]
        drain_timeout_secs: u64,

        /// Disable artificial producer and processing delays
        #[arg(long)]
        fast: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

/// Overrides for the run configuration.
#[derive(Args)]
struct SystemArgs {
    /// Number of producer threads
    #[arg(long)]
    producers: Option<usize>,

    /// Number of consumer threads
    #[arg(long)]
    consumers: Option<usize>,

    /// Items generated by each producer
    #[arg(long)]
    items_per_producer: Option<usize>,

    /// Buffer capacity
    #[arg(long)]
    buffer_size: Option<usize>,
}

impl SystemArgs {
    fn apply(&self, config: &mut AppConfig) {
        let system = &mut config.system;
        if let Some(n) = self.producers {
            system.num_producers = n;
        }
        if let Some(n) = self.consumers {
            system.num_consumers = n;
        }
        if let Some(n) = self.items_per_producer {
            system.items_per_producer = n;
        }
        if let Some(n) = self.buffer_size {
            system.buffer_size = n;
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(AppConfig::default()),
    }
}

/// Route Ctrl+C into a channel so both the async server and the blocking simulation can observe it.
fn install_interrupt_handler() -> Result<Receiver<()>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("installing Ctrl+C handler")?;
    Ok(rx)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    let interrupt = install_interrupt_handler()?;

    match cli.command {
        Commands::Serve {
            bind,
            stream_bind,
            stream_interval_ms,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(stream_bind) = stream_bind {
                config.server.stream_bind = stream_bind;
            }
            if let Some(ms) = stream_interval_ms {
                config.server.stream_interval_ms = ms;
            }
            config.validate()?;
            run_server(config, interrupt)
        }
        Commands::Simulate {
            system,
            drain_timeout_secs,
            fast,
            json,
        } => {
            system.apply(&mut config);
            if fast {
                config.timing = WorkerTiming::immediate();
            }
            config.validate()?;
            let report = run_simulation(
                &config,
                Duration::from_secs(drain_timeout_secs),
                &interrupt,
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
    }
}

fn run_server(config: AppConfig, interrupt: Receiver<()>) -> Result<()> {
    let controller = Arc::new(SystemController::with_timing(config.timing.clone()));
    let publisher = SnapshotPublisher::spawn(
        controller.clone(),
        Duration::from_millis(config.server.stream_interval_ms),
    )?;

    let runtime = tokio::runtime::Runtime::new()?;
    let served = runtime.block_on(async {
        let api = tokio::net::TcpListener::bind(&config.server.bind)
            .await
            .with_context(|| format!("binding control API on {}", config.server.bind))?;
        let stream = tokio::net::TcpListener::bind(&config.server.stream_bind)
            .await
            .with_context(|| format!("binding snapshot stream on {}", config.server.stream_bind))?;

        let stream_task = tokio::spawn(server::serve_stream(stream, publisher.sender()));
        let shutdown = async move {
            let _ = tokio::task::spawn_blocking(move || interrupt.recv()).await;
            info!("shutdown requested");
        };
        let state = AppState::new(controller.clone()).with_defaults(config.system.clone());
        let result = server::serve(api, state, shutdown).await;
        stream_task.abort();
        result.context("control API failed")
    });
    runtime.shutdown_timeout(Duration::from_secs(1));

    if controller.is_running() {
        controller.stop()?;
    }
    publisher.shutdown();
    served
}

fn run_simulation(
    config: &AppConfig,
    drain_timeout: Duration,
    interrupt: &Receiver<()>,
) -> Result<StopReport> {
    let controller = SystemController::with_timing(config.timing.clone());
    controller.start(config.system.clone())?;

    let interrupted = || !interrupt.is_empty();
    let finished = controller.wait_until(Duration::MAX, STATUS_POLL, |status| {
        interrupted() || status.active_producer_count == 0
    });
    if finished && !interrupted() {
        info!("all producers finished, draining buffer");
        let drained = controller.wait_until(drain_timeout, STATUS_POLL, |status| {
            interrupted() || buffer_is_empty(status)
        });
        if !drained {
            warn!(
                timeout_secs = drain_timeout.as_secs(),
                "buffer not drained before timeout"
            );
        }
    }
    if interrupted() {
        warn!("simulation interrupted");
    }

    Ok(controller.stop()?)
}

fn buffer_is_empty(status: &SystemStatus) -> bool {
    status.buffer.as_ref().map_or(true, |b| b.size == 0)
}

fn print_report(report: &StopReport) {
    let snapshot = &report.snapshot;
    println!("=== Simulation finished ===");
    println!(
        "produced: {}  consumed: {}  left in buffer: {}",
        snapshot.total_produced, snapshot.total_consumed, snapshot.size
    );
    println!(
        "throughput: {:.1} produced/s, {:.1} consumed/s over {:.1}s",
        report.throughput.produced_per_sec,
        report.throughput.consumed_per_sec,
        report.throughput.elapsed_secs
    );
    println!(
        "workers: {} producer items, {} consumer items",
        report.items_by(WorkerRole::Producer),
        report.items_by(WorkerRole::Consumer)
    );
    println!(
        "{:<9} {:>8} {:>10} {:>10} {:>10}",
        "priority", "produced", "avg ms", "p95 ms", "max ms"
    );
    for stats in &report.wait_stats {
        let ms = |d: Option<Duration>| {
            d.map(|d| format!("{:.1}", d.as_secs_f64() * 1_000.0))
                .unwrap_or_else(|| "-".to_string())
        };
        println!(
            "{:<9} {:>8} {:>10} {:>10} {:>10}",
            stats.priority.name(),
            snapshot.produced_by_priority[stats.priority],
            ms(Some(stats.avg_wait).filter(|_| stats.window_count > 0)),
            ms(stats.p95),
            ms(stats.max_wait)
        );
    }
}
