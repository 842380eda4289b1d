//! Packet producers. Exactly one runs per process, on a dedicated thread,
//! and it is the only writer to the pipeline.

pub mod sample;
pub mod udp;

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::packet::Packet;
use crate::pipeline::{CaptureState, Pipeline};

pub use sample::{SampleDataset, SampleReplayer, DEFAULT_REPLAY_INTERVAL};
pub use udp::UdpCapture;

/// Local endpoint the live source connects to
pub const DEFAULT_UDP_ENDPOINT: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2237));

pub const DEFAULT_SAMPLE_PATH: &str = "data/sample_packets.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CaptureMode {
    /// Live UDP capture, falling back to the sample dataset on failure
    Udp,
    /// Replay the sample dataset only
    Sample,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub mode: CaptureMode,
    pub udp_endpoint: SocketAddr,
    pub sample_path: PathBuf,
    pub replay_interval: Duration,
    pub loop_sample: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Sample,
            udp_endpoint: DEFAULT_UDP_ENDPOINT,
            sample_path: PathBuf::from(DEFAULT_SAMPLE_PATH),
            replay_interval: DEFAULT_REPLAY_INTERVAL,
            loop_sample: false,
        }
    }
}

/// Emission side of one source run. Timestamps never decrease across
/// everything the run emits, live capture and fallback replay alike.
#[derive(Debug)]
pub struct Emitter<'a> {
    pipeline: &'a Pipeline,
    last_timestamp: f64,
}

impl<'a> Emitter<'a> {
    pub fn new(pipeline: &'a Pipeline) -> Self {
        Self {
            pipeline,
            last_timestamp: f64::NEG_INFINITY,
        }
    }

    pub fn emit(&mut self, packet: Packet) {
        let packet = if packet.timestamp() < self.last_timestamp {
            packet.restamped(self.last_timestamp)
        } else {
            packet
        };
        self.last_timestamp = packet.timestamp();
        self.pipeline.emit(packet);
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.pipeline
    }
}

/// Start the capture source on its own thread
pub fn spawn(
    config: CaptureConfig,
    pipeline: Arc<Pipeline>,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("capture".into())
        .spawn(move || run(&config, &pipeline, &running))
        .context("Failed to spawn capture thread")
}

/// Run the configured source to completion. Never fails: transport errors
/// route to the sample fallback and dataset errors leave the pipeline idle.
pub fn run(config: &CaptureConfig, pipeline: &Pipeline, running: &AtomicBool) {
    let mut emitter = Emitter::new(pipeline);

    match config.mode {
        CaptureMode::Udp => {
            info!("Starting UDP listener for {}", config.udp_endpoint);
            match run_udp(config, &mut emitter, running) {
                Ok(()) => {
                    pipeline.set_capture_state(CaptureState::Idle);
                    return;
                }
                Err(e) => warn!("UDP capture failed: {:#}", e),
            }
            warn!("Falling back to sample data...");
            replay_sample(config, &mut emitter, running);
        }
        CaptureMode::Sample => replay_sample(config, &mut emitter, running),
    }
}

/// Live capture until shutdown (Ok) or a connect/receive failure (Err)
fn run_udp(config: &CaptureConfig, emitter: &mut Emitter<'_>, running: &AtomicBool) -> Result<()> {
    let capture = UdpCapture::connect(config.udp_endpoint)?;
    emitter.pipeline().set_capture_state(CaptureState::LiveUdp);
    capture.run(emitter, running)?;
    Ok(())
}

fn replay_sample(config: &CaptureConfig, emitter: &mut Emitter<'_>, running: &AtomicBool) {
    emitter.pipeline().set_capture_state(CaptureState::ReplayingSample);

    let replayer = SampleReplayer::new(&config.sample_path, config.replay_interval)
        .repeat(config.loop_sample);
    if let Err(e) = replayer.run(emitter, running) {
        error!("Error loading sample data: {:#}", e);
    }

    emitter.pipeline().set_capture_state(CaptureState::Idle);
}
