pub mod config;
pub mod logging;
pub mod ports;

pub use config::{AudioFormat, Config, EngineConfig};
