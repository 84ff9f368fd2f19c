//! Fakes shared by the unit tests.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PointConfig;
use crate::engine::{Engine, EngineBuilder, EngineError};
use crate::protect::{DomainGuard, ResolveSignal};
use crate::stats::{counter_name, StatsManager, TrafficDirection};
use crate::support::SupportSet;

/// Accepted by the config loader; one `proxy` outbound, stats enabled.
pub const VALID_CONFIG: &str =
    r#"{"stats":{},"outbounds":[{"tag":"proxy","protocol":"blackhole"}]}"#;

pub const MALFORMED_CONFIG: &str = r#"{"outbounds": [ {"tag": "proxy", "#;

/// Records every status and answers `protect` with a switchable verdict.
pub struct RecordingSupport {
    allow_protect: AtomicBool,
    protected: Mutex<Vec<i32>>,
    statuses: Mutex<Vec<String>>,
    status_tx: Sender<String>,
    status_rx: Receiver<String>,
}

impl RecordingSupport {
    pub fn new() -> Self {
        let (status_tx, status_rx) = crossbeam_channel::unbounded();
        Self {
            allow_protect: AtomicBool::new(true),
            protected: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            status_tx,
            status_rx,
        }
    }

    pub fn refuse_protect(&self) {
        self.allow_protect.store(false, Ordering::SeqCst);
    }

    pub fn protected_fds(&self) -> Vec<i32> {
        self.protected.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    /// Waits for the next status not yet consumed by a previous wait.
    pub fn next_status(&self, timeout: Duration) -> Option<String> {
        self.status_rx.recv_timeout(timeout).ok()
    }
}

impl SupportSet for RecordingSupport {
    fn protect(&self, fd: i32) -> bool {
        self.protected.lock().push(fd);
        self.allow_protect.load(Ordering::SeqCst)
    }

    fn on_emit_status(&self, status: &str) {
        self.statuses.lock().push(status.to_string());
        let _ = self.status_tx.send(status.to_string());
    }
}

/// How [`FakeGuard`] finishes each resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveMode {
    /// Completes inside `prepare_domain` with the given readiness.
    Immediate(bool),
    /// Alternates ready / not ready, starting with ready.
    Alternate,
    /// Waits for [`FakeGuard::complete`].
    Manual,
}

#[derive(Default)]
struct GuardCycle {
    completion: Option<Sender<()>>,
    signal: Option<Receiver<()>>,
    cancel: Option<Receiver<()>>,
}

pub struct FakeGuard {
    mode: ResolveMode,
    ready: AtomicBool,
    cycles: AtomicUsize,
    cycle: Mutex<GuardCycle>,
    domains: Mutex<Vec<(String, bool)>>,
}

impl FakeGuard {
    pub fn new(mode: ResolveMode) -> Self {
        Self {
            mode,
            ready: AtomicBool::new(false),
            cycles: AtomicUsize::new(0),
            cycle: Mutex::new(GuardCycle::default()),
            domains: Mutex::new(Vec::new()),
        }
    }

    /// Finishes a `Manual` resolution.
    pub fn complete(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        self.cycle.lock().completion.take();
    }

    pub fn domains(&self) -> Vec<(String, bool)> {
        self.domains.lock().clone()
    }

    /// Whether the cancel signal handed to the last `prepare_domain` closed.
    pub fn last_cancel_closed(&self) -> bool {
        match self.cycle.lock().cancel.as_ref() {
            Some(cancel) => matches!(cancel.try_recv(), Err(TryRecvError::Disconnected)),
            None => false,
        }
    }
}

impl DomainGuard for FakeGuard {
    fn prepare_resolve_signal(&self) {
        let (completion, signal) = crossbeam_channel::bounded(0);
        self.ready.store(false, Ordering::SeqCst);
        *self.cycle.lock() = GuardCycle {
            completion: Some(completion),
            signal: Some(signal),
            cancel: None,
        };
    }

    fn resolve_signal(&self) -> ResolveSignal {
        self.cycle
            .lock()
            .signal
            .clone()
            .unwrap_or_else(crossbeam_channel::never)
    }

    fn prepare_domain(&self, domain: &str, cancel: Receiver<()>, prefer_ipv6: bool) {
        self.domains.lock().push((domain.to_string(), prefer_ipv6));
        let mut cycle = self.cycle.lock();
        cycle.cancel = Some(cancel);
        let ready = match self.mode {
            ResolveMode::Manual => return,
            ResolveMode::Immediate(ready) => ready,
            ResolveMode::Alternate => self.cycles.fetch_add(1, Ordering::SeqCst) % 2 == 0,
        };
        self.ready.store(ready, Ordering::SeqCst);
        cycle.completion.take();
    }

    fn is_server_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Engine double that counts live instances and can be told to fail.
#[derive(Default)]
pub struct FakeBuilder {
    builds: AtomicUsize,
    live: Arc<AtomicUsize>,
    pub fail_build: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_close: AtomicBool,
    /// Bytes preloaded into the `proxy` uplink counter of each new engine.
    pub preload_uplink: AtomicI64,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_engines(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

struct FakeEngine {
    live: Arc<AtomicUsize>,
    stats: Option<Arc<StatsManager>>,
    fail_start: bool,
    fail_close: bool,
    running: bool,
}

impl Engine for FakeEngine {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.fail_start {
            return Err(EngineError::Start("scripted failure".into()));
        }
        self.running = true;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), EngineError> {
        if std::mem::take(&mut self.running) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        if self.fail_close {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::Other,
                "scripted close failure",
            )));
        }
        Ok(())
    }

    fn stats(&self) -> Option<Arc<StatsManager>> {
        self.stats.clone()
    }
}

impl EngineBuilder for FakeBuilder {
    fn build(&self, config: PointConfig) -> Result<Box<dyn Engine>, EngineError> {
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(EngineError::Build("scripted failure".into()));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        let stats = config.stats_enabled().then(|| {
            let manager = StatsManager::new();
            for outbound in &config.outbounds {
                for direction in [TrafficDirection::Uplink, TrafficDirection::Downlink] {
                    manager.register_counter(&counter_name(&outbound.tag, direction));
                }
            }
            manager
                .register_counter(&counter_name("proxy", TrafficDirection::Uplink))
                .add(self.preload_uplink.load(Ordering::SeqCst));
            manager
        });
        Ok(Box::new(FakeEngine {
            live: Arc::clone(&self.live),
            stats,
            fail_start: self.fail_start.load(Ordering::SeqCst),
            fail_close: self.fail_close.load(Ordering::SeqCst),
            running: false,
        }))
    }
}
