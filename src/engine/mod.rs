//! Engine construction seam. The lifecycle only sees [`EngineBuilder`] and
//! [`Engine`]; [`CoreEngineBuilder`] is the implementation exported over FFI.

mod relay;

pub use self::relay::{CoreEngine, CoreEngineBuilder};

use once_cell::sync::OnceCell;
use std::sync::Arc;
use thiserror::Error;

use crate::config::PointConfig;
use crate::logger::LogLevel;
use crate::stats::StatsManager;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine construction failed: {0}")]
    Build(String),
    #[error("engine start failed: {0}")]
    Start(String),
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A constructed engine instance.
pub trait Engine: Send {
    /// Starts serving. On error nothing the call acquired may remain running.
    fn start(&mut self) -> Result<(), EngineError>;

    /// Releases every resource synchronously. Safe to call more than once.
    fn close(&mut self) -> Result<(), EngineError>;

    /// Counter store of this instance, when stats are enabled.
    fn stats(&self) -> Option<Arc<StatsManager>>;
}

pub trait EngineBuilder: Send + Sync {
    fn build(&self, config: PointConfig) -> Result<Box<dyn Engine>, EngineError>;
}

pub type LogHandler = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

static LOG_HANDLER: OnceCell<LogHandler> = OnceCell::new();

/// Installs the process-wide sink for engine output. The first handler
/// wins; later calls return false and change nothing.
pub fn register_log_handler(handler: LogHandler) -> bool {
    LOG_HANDLER.set(handler).is_ok()
}

pub(crate) fn log(threshold: Option<LogLevel>, level: LogLevel, message: &str) {
    let Some(threshold) = threshold else { return };
    if level > threshold {
        return;
    }
    if let Some(handler) = LOG_HANDLER.get() {
        handler(level, message);
    }
}

#[cfg(test)]
mod tests;
