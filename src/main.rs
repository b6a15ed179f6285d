//! Heapscope - heap census and reference-graph tracer
//!
//! Runs the census sampler and HTTP API over an in-process demo heap with a
//! deliberately leaky workload.

use clap::{Parser, Subcommand};
use heapscope_core::{
    api::{shutdown_signal, ApiServer},
    workload::DemoWorkload,
    Heapscope, HeapscopeConfig, ManagedHeap, SizeRefresh,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "heapscope")]
#[command(about = "Heap census and reference-graph tracer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file (TOML)
    #[arg(short, long, env = "HEAPSCOPE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo workload, census sampler and HTTP API until Ctrl-C
    Serve {
        /// Override the API address
        #[arg(long)]
        addr: Option<String>,

        /// Milliseconds between demo workload steps
        #[arg(long, default_value = "500")]
        step_ms: u64,
    },

    /// Run census ticks against the demo heap and print the type table
    Census {
        /// Number of ticks
        #[arg(long, default_value = "5")]
        ticks: usize,

        /// Refresh type sizes before printing
        #[arg(long)]
        sizes: bool,
    },
}

fn demo_heap() -> ManagedHeap {
    ManagedHeap::new()
        .with_size_estimation(true)
        .with_snapshot_tracking(true)
}

async fn serve(mut config: HeapscopeConfig, addr: Option<String>, step_ms: u64) -> anyhow::Result<()> {
    if let Some(addr) = addr {
        config.api.addr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", addr, e))?;
    }

    let heap = demo_heap();
    let workload = DemoWorkload::install(&heap)?;
    let scope = Arc::new(Heapscope::new(Arc::new(heap), &config));

    let (stop_tx, _) = broadcast::channel(1);
    let workload_handle = workload.spawn(Duration::from_millis(step_ms.max(1)), stop_tx.subscribe());
    let sampler_handle = scope.start();

    let server = ApiServer::new(config.api.clone(), scope.clone());
    debug!("API server instance {}", server.instance_id());
    server
        .serve(shutdown_signal(tokio::signal::ctrl_c()))
        .await?;

    scope.shutdown();
    let _ = stop_tx.send(());
    sampler_handle.await?;
    workload_handle.await?;
    Ok(())
}

async fn census(config: HeapscopeConfig, ticks: usize, sizes: bool) -> anyhow::Result<()> {
    let heap = demo_heap();
    let mut workload = DemoWorkload::install(&heap)?;
    let scope = Heapscope::new(Arc::new(heap), &config);

    for _ in 0..ticks {
        workload.step()?;
        scope.tick_now().await?;
    }
    if sizes {
        if let SizeRefresh::Unavailable = scope.refresh_sizes().await? {
            info!("size estimation unavailable");
        }
    }

    let stats = scope.type_stats(0).await;
    let width = stats
        .iter()
        .map(|row| row.type_name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<width$}  {:>6}  {:>6}  {:>6}  {}",
        "TYPE", "MIN", "CUR", "MAX", "SIZE",
        width = width
    );
    for row in stats {
        println!(
            "{:<width$}  {:>6}  {:>6}  {:>6}  {}",
            row.type_name,
            row.min,
            row.current,
            row.max,
            row.size,
            width = width
        );
    }
    println!();
    println!("{} ticks, {} workload steps", scope.samples().await, workload.steps());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Suppress broadcast "recv error" spam from SSE disconnections
    let filter = EnvFilter::new(format!(
        "heapscope={level},heapscope_core={level},tower_http={level},tokio::sync::broadcast=error,tokio_stream=error",
        level = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Heapscope v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = HeapscopeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { addr, step_ms } => serve(config, addr, step_ms).await,
        Commands::Census { ticks, sizes } => census(config, ticks, sizes).await,
    }
}
