//! Runtime half of `tmon`: status polling, log tails, the action dispatcher and the
//! [`Engine`] facade that ties them to a loaded configuration.

pub mod control_client;
pub mod dispatch;
pub mod engine;
pub mod log_tail;
pub mod mutex;
pub mod output_log;
pub mod scheduler;
pub mod status;

#[cfg(test)]
mod test_support;

pub use control_client::ControlClient;
pub use dispatch::{ActionDispatcher, ActionError, ActionOutcome, ActionSource};
pub use engine::{Engine, EngineError, EngineOptions};
pub use log_tail::TailRender;
pub use mutex::MutexRegistry;
pub use output_log::ActionOutputLog;
pub use scheduler::{PassOutcome, RefreshScheduler};
pub use status::{StatusFetchError, StatusSnapshot};
