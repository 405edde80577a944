pub mod args;
pub mod config;
pub mod control;
pub mod extract;
pub mod jsonpath;

pub use config::{load_config, ConfigError, MonitorConfig, Target};
pub use control::{ControlFailure, Endpoint, JobState, ProtocolError};
