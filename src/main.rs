use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use udp_packet_relay::capture::{self, CaptureConfig, CaptureMode, DEFAULT_SAMPLE_PATH};
use udp_packet_relay::pipeline::{Pipeline, PipelineConfig};
use udp_packet_relay::server;
use udp_packet_relay::store::DEFAULT_STORE_CAPACITY;

#[derive(Parser, Debug)]
#[command(name = "udp-packet-relay")]
#[command(about = "Relay UDP packets (or a sample dataset) to browsers over server-sent events")]
struct Args {
    /// HTTP address to serve the viewer and event stream on
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,

    /// Packet source
    #[arg(short, long, value_enum, default_value = "sample")]
    mode: CaptureMode,

    /// UDP endpoint to connect to in udp mode
    #[arg(short, long, default_value = "127.0.0.1:2237")]
    udp_endpoint: SocketAddr,

    /// Sample dataset replayed in sample mode or on UDP failure
    #[arg(short, long, default_value = DEFAULT_SAMPLE_PATH)]
    sample_file: PathBuf,

    /// Delay between replayed sample packets in milliseconds
    #[arg(long, default_value = "500")]
    replay_interval_ms: u64,

    /// Replay the sample dataset indefinitely
    #[arg(long)]
    loop_sample: bool,

    /// Number of recent packets kept for late-joining viewers
    #[arg(long, default_value_t = DEFAULT_STORE_CAPACITY)]
    history: usize,

    /// Bound each viewer's queue; viewers that fall this far behind are disconnected
    #[arg(long)]
    session_queue_capacity: Option<usize>,

    /// Stats report interval in seconds (0 = disabled)
    #[arg(long, default_value = "30")]
    stats_interval: u64,

    /// Verbose logging (default: false)
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    info!("Starting UDP packet relay");
    info!("Source mode: {:?}", args.mode);

    let pipeline = Arc::new(Pipeline::new(PipelineConfig {
        history: args.history,
        session_queue_capacity: args.session_queue_capacity,
    }));
    let running = Arc::new(AtomicBool::new(true));

    // Capture must be producing before the first viewer can connect
    let capture_config = CaptureConfig {
        mode: args.mode,
        udp_endpoint: args.udp_endpoint,
        sample_path: args.sample_file,
        replay_interval: Duration::from_millis(args.replay_interval_ms),
        loop_sample: args.loop_sample,
    };
    let capture_handle = capture::spawn(capture_config, pipeline.clone(), running.clone())?;

    let stats_handle = if args.stats_interval > 0 {
        let pipeline = pipeline.clone();
        let period = Duration::from_secs(args.stats_interval);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut last_packets = 0u64;
            let mut last_time = Instant::now();

            loop {
                interval.tick().await;

                let stats = pipeline.stats();
                let now = Instant::now();
                let elapsed = now.duration_since(last_time).as_secs_f64().max(0.001);
                let pps = (stats.emitted_packets - last_packets) as f64 / elapsed;

                info!(
                    "Source: {:?} - Packets: {} - Bytes: {} - Rate: {:.1} pps - Viewers: {} - Stored: {}/{} - Dropped viewers: {}",
                    stats.capture_state,
                    stats.emitted_packets,
                    stats.emitted_bytes,
                    pps,
                    stats.active_sessions,
                    stats.stored_packets,
                    stats.store_capacity,
                    stats.overflowed_sessions
                );

                last_packets = stats.emitted_packets;
                last_time = now;
            }
        }))
    } else {
        None
    };

    let shutdown = {
        let pipeline = pipeline.clone();
        let running = running.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
            running.store(false, Ordering::Relaxed);
            // Open event streams would otherwise hold graceful shutdown forever
            pipeline.close_sessions();
        }
    };

    let served = server::serve(pipeline.clone(), args.bind, shutdown).await;

    running.store(false, Ordering::Relaxed);
    if let Some(handle) = stats_handle {
        handle.abort();
    }
    if tokio::task::spawn_blocking(move || capture_handle.join())
        .await
        .map(|joined| joined.is_err())
        .unwrap_or(true)
    {
        warn!("Capture thread did not shut down cleanly");
    }

    let stats = pipeline.stats();
    info!("======= RELAY SUMMARY =======");
    info!("Packets relayed: {}", stats.emitted_packets);
    info!("Bytes relayed: {}", stats.emitted_bytes);
    info!("Viewers dropped on overflow: {}", stats.overflowed_sessions);
    info!("=============================");

    served
}
