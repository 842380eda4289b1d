use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::Emitter;
use crate::packet::{Packet, PacketRecord};

/// Delay between replayed packets, simulating live arrival
pub const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_millis(500);

// Records stay untyped until validated one by one
#[derive(Debug, Deserialize)]
struct SampleFile {
    packets: Vec<serde_json::Value>,
}

/// Pre-recorded packets loaded from a JSON dataset
#[derive(Debug)]
pub struct SampleDataset {
    packets: Vec<Packet>,
    skipped: usize,
}

impl SampleDataset {
    /// Load and validate a dataset. Records that are malformed or whose
    /// declared size disagrees with their payload are skipped; a missing file,
    /// invalid JSON, or a missing `packets` list is an error.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Opening sample dataset: {}", path.display());

        let file = File::open(path)
            .with_context(|| format!("Failed to open sample dataset: {}", path.display()))?;
        let sample: SampleFile = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse sample dataset: {}", path.display()))?;

        let mut packets = Vec::with_capacity(sample.packets.len());
        let mut skipped = 0;
        for (index, record) in sample.packets.into_iter().enumerate() {
            let parsed = serde_json::from_value::<PacketRecord>(record)
                .map_err(anyhow::Error::from)
                .and_then(Packet::try_from);
            match parsed {
                Ok(packet) => packets.push(packet),
                Err(e) => {
                    warn!("Skipping sample packet #{}: {}", index, e);
                    skipped += 1;
                }
            }
        }

        info!("Loaded {} sample packets", packets.len());
        Ok(Self { packets, skipped })
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Records rejected during validation
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Fixed-interval pacing between emissions. The first packet goes out
/// immediately, every later one waits until `interval` after the previous.
struct ReplayPacer {
    interval: Duration,
    last_send: Option<Instant>,
}

impl ReplayPacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_send: None,
        }
    }

    /// Returns false if `running` was cleared while waiting
    fn acquire(&mut self, running: &AtomicBool) -> bool {
        if let Some(last) = self.last_send {
            let target = last + self.interval;
            // Sleep in short slices so shutdown is not held up by long intervals
            loop {
                if !running.load(Ordering::Relaxed) {
                    return false;
                }
                let now = Instant::now();
                if now >= target {
                    break;
                }
                thread::sleep((target - now).min(Duration::from_millis(50)));
            }
        }
        self.last_send = Some(Instant::now());
        running.load(Ordering::Relaxed)
    }
}

/// Replays a dataset file into the pipeline
#[derive(Debug, Clone)]
pub struct SampleReplayer {
    path: PathBuf,
    interval: Duration,
    repeat: bool,
}

impl SampleReplayer {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            repeat: false,
        }
    }

    /// Start over from the first packet after the last one instead of stopping
    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Emit every dataset packet in file order, paced by the interval.
    /// Returns the number of packets emitted; load failures are returned
    /// to the caller, which decides whether they are fatal.
    pub fn run(&self, emitter: &mut Emitter<'_>, running: &AtomicBool) -> Result<u64> {
        let dataset = SampleDataset::load(&self.path)?;
        if dataset.is_empty() {
            warn!("Sample dataset {} contains no usable packets", self.path.display());
            return Ok(0);
        }

        let mut pacer = ReplayPacer::new(self.interval);
        let mut emitted = 0u64;
        let mut pass = 0u64;

        'replay: loop {
            pass += 1;
            debug!("Starting sample replay pass #{}", pass);

            for packet in dataset.packets() {
                if !pacer.acquire(running) {
                    break 'replay;
                }
                emitter.emit(packet.clone());
                emitted += 1;
                debug!("Replayed sample packet: size={} bytes", packet.size());
            }

            if !self.repeat {
                break;
            }
        }

        info!("Finished replaying sample data ({} packets, {} passes)", emitted, pass);
        Ok(emitted)
    }
}
