//! Relays packets from a local UDP source, or a bundled sample dataset when
//! the source is unavailable, to any number of viewers over server-sent events.

pub mod capture;
pub mod delivery;
pub mod packet;
pub mod pipeline;
pub mod server;
pub mod store;

pub use capture::{CaptureConfig, CaptureMode};
pub use delivery::{DeliveryQueue, Subscription};
pub use packet::Packet;
pub use pipeline::{CaptureState, Pipeline, PipelineConfig, PipelineStats};
pub use store::PacketStore;
