pub mod sim_server;
pub mod wire;

pub use sim_server::{fixed_latency, throughput_latency, LatencyFn, SimServer};
pub use wire::{ReqHeader, SimVolumeClient, REQ_HEADER_LENGTH};
