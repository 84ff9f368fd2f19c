//! Host-facing controller for one tunnel point.

use parking_lot::Mutex;
use std::sync::{Arc, Once};

use crate::config::{self, ConfigError};
use crate::engine::{self, CoreEngineBuilder, EngineBuilder};
use crate::lifecycle::{Lifecycle, Phase, StartError};
use crate::logger::{self, BreadcrumbFlags};
use crate::protect::{DomainGuard, ProtectedDialer};
use crate::support::SupportSet;

static ENGINE_LOGGING: Once = Once::new();

/// Routes engine output into the host log sink. Process-wide; only the
/// first point constructed performs the registration.
fn install_engine_logging() {
    ENGINE_LOGGING.call_once(|| {
        let installed = engine::register_log_handler(Arc::new(|level, message: &str| {
            logger::engine_line(level, message)
        }));
        if !installed {
            logger::debug("engine log handler was already registered");
        }
    });
}

#[derive(Default)]
struct PointSettings {
    domain_name: String,
    config_text: String,
}

/// Owns the lifecycle of at most one running engine.
///
/// The host sets the server domain and configuration text, then calls
/// [`run_loop`](Self::run_loop). Statuses arrive through the support set:
/// `Running` once per successful start, followed by exactly one of `Closed`
/// (host stop) or `Shutdown` (server could not be resolved).
pub struct TunnelPoint {
    lifecycle: Arc<Lifecycle>,
    settings: Mutex<PointSettings>,
}

impl TunnelPoint {
    /// Point backed by [`CoreEngineBuilder`] and a [`ProtectedDialer`] that
    /// protects sockets through `support`.
    pub fn new(support: Arc<dyn SupportSet>, prefer_external_dns: bool) -> Self {
        let dialer = Arc::new(ProtectedDialer::new(
            Arc::clone(&support),
            prefer_external_dns,
        ));
        let builder = Arc::new(CoreEngineBuilder::new(Arc::clone(&dialer)));
        Self::with_parts(support, builder, dialer)
    }

    pub fn with_parts(
        support: Arc<dyn SupportSet>,
        builder: Arc<dyn EngineBuilder>,
        guard: Arc<dyn DomainGuard>,
    ) -> Self {
        install_engine_logging();
        logger::breadcrumb(BreadcrumbFlags::LIFECYCLE, "tunnel point created");
        Self {
            lifecycle: Lifecycle::new(builder, guard, support),
            settings: Mutex::new(PointSettings::default()),
        }
    }

    /// Server endpoint resolved before each start, as `host:port`.
    pub fn set_domain_name(&self, domain_name: impl Into<String>) {
        self.settings.lock().domain_name = domain_name.into();
    }

    pub fn domain_name(&self) -> String {
        self.settings.lock().domain_name.clone()
    }

    pub fn set_config(&self, config_text: impl Into<String>) {
        self.settings.lock().config_text = config_text.into();
    }

    /// Starts the engine from the current settings. A no-op success when
    /// already running.
    pub fn run_loop(&self, prefer_ipv6: bool) -> Result<(), StartError> {
        let (domain_name, config_text) = {
            let settings = self.settings.lock();
            (settings.domain_name.clone(), settings.config_text.clone())
        };
        self.lifecycle.start(&domain_name, &config_text, prefer_ipv6)
    }

    /// Stops the engine. Returns false when nothing was running.
    pub fn stop_loop(&self) -> bool {
        self.lifecycle.stop()
    }

    /// Read-and-reset of the `(tag, direction)` traffic counter; zero when
    /// idle or unknown. Never waits on a start or stop.
    pub fn query_stats(&self, tag: &str, direction: &str) -> i64 {
        self.lifecycle.stats().query(tag, direction)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }
}

impl Drop for TunnelPoint {
    fn drop(&mut self) {
        self.lifecycle.stop();
    }
}

/// Pre-flight check of configuration text; parses and validates, starts nothing.
pub fn validate_config(config_text: &str) -> Result<(), ConfigError> {
    config::load_json(config_text).map(|_| ())
}

pub fn version() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}
