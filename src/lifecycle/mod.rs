//! Start/stop state machine for the single engine a point may run.
//!
//! One mutex serializes every transition, manual or watchdog-driven. The slot
//! it guards is the whole running state: `Some` holds the engine and the
//! cancel signal of the current cycle, `None` means idle.
//!
//! A transition records its status while it holds the lock and delivers it
//! after releasing it. Delivery goes through [`StatusQueue`], so hosts see
//! statuses in transition order and may call `start`/`stop` from
//! `on_emit_status`.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{self, ConfigError};
use crate::engine::{Engine, EngineBuilder, EngineError};
use crate::logger::{self, BreadcrumbFlags};
use crate::protect::DomainGuard;
use crate::stats::StatsQuery;
use crate::support::{PointStatus, SupportSet};
use crate::watchdog::{ForcedStop, ResolutionWatchdog};

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    EngineStart(#[from] EngineError),
}

impl StartError {
    pub fn is_config_error(&self) -> bool {
        matches!(self, StartError::Config(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Starting,
            2 => Phase::Running,
            3 => Phase::Stopping,
            _ => Phase::Idle,
        }
    }
}

/// Closing this sender (by dropping it) is the only way a cycle's watchdog
/// and resolver are released.
pub type CancelSignal = Sender<()>;

struct RunningCycle {
    generation: u64,
    engine: Box<dyn Engine>,
    cancel: CancelSignal,
}

pub struct Lifecycle {
    slot: Mutex<Option<RunningCycle>>,
    phase: AtomicU8,
    generation: AtomicU64,
    stats: StatsQuery,
    statuses: StatusQueue,
    builder: Arc<dyn EngineBuilder>,
    guard: Arc<dyn DomainGuard>,
    support: Arc<dyn SupportSet>,
}

impl Lifecycle {
    pub fn new(
        builder: Arc<dyn EngineBuilder>,
        guard: Arc<dyn DomainGuard>,
        support: Arc<dyn SupportSet>,
    ) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            phase: AtomicU8::new(Phase::Idle as u8),
            generation: AtomicU64::new(0),
            stats: StatsQuery::new(),
            statuses: StatusQueue::default(),
            builder,
            guard,
            support,
        })
    }

    /// Lock-free view of the state machine.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn stats(&self) -> &StatsQuery {
        &self.stats
    }

    /// Idle -> Running. Succeeds without doing anything when already running.
    pub fn start(
        self: &Arc<Self>,
        domain: &str,
        config_text: &str,
        prefer_ipv6: bool,
    ) -> Result<(), StartError> {
        let result = self.start_locked(domain, config_text, prefer_ipv6);
        self.statuses.deliver(self.support.as_ref());
        result
    }

    fn start_locked(
        self: &Arc<Self>,
        domain: &str,
        config_text: &str,
        prefer_ipv6: bool,
    ) -> Result<(), StartError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            logger::breadcrumb(BreadcrumbFlags::LIFECYCLE, "start ignored: already running");
            return Ok(());
        }
        self.set_phase(Phase::Starting);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        logger::breadcrumb(
            BreadcrumbFlags::LIFECYCLE,
            format!("cycle {generation} starting (domain={domain:?}, prefer_ipv6={prefer_ipv6})"),
        );

        let (cancel, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        self.guard.prepare_resolve_signal();
        let watchdog = ResolutionWatchdog::new(
            generation,
            self.guard.resolve_signal(),
            cancel_rx.clone(),
            Arc::clone(&self.guard),
        );
        if let Err(error) = watchdog.spawn(Arc::clone(self) as Arc<dyn ForcedStop>) {
            self.set_phase(Phase::Idle);
            logger::error(format!("cannot spawn resolution watchdog: {error}"));
            return Err(StartError::EngineStart(EngineError::Io(error)));
        }
        self.guard.prepare_domain(domain, cancel_rx, prefer_ipv6);

        match self.launch(config_text) {
            Ok(engine) => {
                self.stats.attach(engine.stats());
                *slot = Some(RunningCycle {
                    generation,
                    engine,
                    cancel,
                });
                self.set_phase(Phase::Running);
                logger::info(format!("cycle {generation} running"));
                self.statuses.record(PointStatus::Running);
                Ok(())
            }
            Err(error) => {
                // Releases the watchdog and resolver armed above.
                drop(cancel);
                self.set_phase(Phase::Idle);
                logger::error(format!("cycle {generation} failed to start: {error}"));
                Err(error)
            }
        }
    }

    /// Running -> Idle on the host's request. Returns false when idle.
    pub fn stop(&self) -> bool {
        self.finish(None, PointStatus::Closed)
    }

    fn launch(&self, config_text: &str) -> Result<Box<dyn Engine>, StartError> {
        let config = config::load_json(config_text)?;
        let mut engine = self.builder.build(config)?;
        if let Err(error) = engine.start() {
            if let Err(close_error) = engine.close() {
                logger::warn(format!("closing failed engine: {close_error}"));
            }
            return Err(error.into());
        }
        Ok(engine)
    }

    /// Shared stop path. `expected` restricts the stop to one generation.
    fn finish(&self, expected: Option<u64>, status: PointStatus) -> bool {
        let stopped = self.finish_locked(expected, status);
        self.statuses.deliver(self.support.as_ref());
        stopped
    }

    fn finish_locked(&self, expected: Option<u64>, status: PointStatus) -> bool {
        let mut slot = self.slot.lock();
        let current = match slot.as_ref() {
            Some(cycle) => cycle.generation,
            None => return false,
        };
        if expected.is_some_and(|generation| generation != current) {
            return false;
        }
        let Some(RunningCycle {
            generation,
            mut engine,
            cancel,
        }) = slot.take()
        else {
            return false;
        };

        self.set_phase(Phase::Stopping);
        drop(cancel);
        if let Err(error) = engine.close() {
            logger::error(format!("cycle {generation} teardown: {error}"));
        }
        drop(engine);
        self.stats.detach();
        self.set_phase(Phase::Idle);
        logger::info(format!("cycle {generation} stopped ({status})"));
        self.statuses.record(status);
        true
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Statuses waiting for delivery, in the order transitions recorded them.
///
/// Whichever caller finds the queue idle becomes the deliverer and drains it
/// without holding any lock across a callback. Statuses recorded meanwhile,
/// including from inside a callback, are picked up by that same loop.
#[derive(Default)]
struct StatusQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PointStatus>,
    delivering: bool,
}

impl StatusQueue {
    fn record(&self, status: PointStatus) {
        self.state.lock().pending.push_back(status);
    }

    fn deliver(&self, support: &dyn SupportSet) {
        {
            let mut state = self.state.lock();
            if state.delivering {
                return;
            }
            state.delivering = true;
        }
        let _unwind = DeliveryGuard(self);
        loop {
            let status = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(status) => status,
                    None => {
                        // Cleared under the lock that saw the queue empty.
                        state.delivering = false;
                        return;
                    }
                }
            };
            logger::breadcrumb(BreadcrumbFlags::LIFECYCLE, format!("emit {status}"));
            support.on_emit_status(status.as_str());
        }
    }
}

/// Hands delivery back if a host callback unwinds mid-drain.
struct DeliveryGuard<'a>(&'a StatusQueue);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.state.lock().delivering = false;
        }
    }
}

impl ForcedStop for Lifecycle {
    fn force_stop(&self, generation: u64) -> bool {
        self.finish(Some(generation), PointStatus::Shutdown)
    }
}
