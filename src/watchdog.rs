//! Background wait on a start cycle's domain resolution.

use crossbeam_channel::{select, Receiver};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::logger::{self, BreadcrumbFlags};
use crate::protect::{DomainGuard, ResolveSignal};

/// Receiver of forced stops. `generation` names the start cycle the
/// watchdog was armed for; a stop aimed at a finished cycle must be ignored.
pub trait ForcedStop: Send + Sync {
    /// Returns true when this call actually stopped a running cycle.
    fn force_stop(&self, generation: u64) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The cycle was cancelled before resolution finished.
    Cancelled,
    /// Resolution finished with a usable server.
    Resolved,
    /// Resolution failed and the cycle was shut down.
    ForcedStop,
    /// Resolution failed but the cycle had already ended.
    Stale,
}

/// Waits for whichever comes first: the resolve signal closing or the cycle's
/// cancel signal closing. Holds no lock while waiting.
pub struct ResolutionWatchdog {
    generation: u64,
    resolved: ResolveSignal,
    cancel: Receiver<()>,
    guard: Arc<dyn DomainGuard>,
}

impl ResolutionWatchdog {
    pub fn new(
        generation: u64,
        resolved: ResolveSignal,
        cancel: Receiver<()>,
        guard: Arc<dyn DomainGuard>,
    ) -> Self {
        Self {
            generation,
            resolved,
            cancel,
            guard,
        }
    }

    pub fn spawn(self, target: Arc<dyn ForcedStop>) -> io::Result<JoinHandle<WatchdogOutcome>> {
        thread::Builder::new()
            .name(format!("resolve-watchdog-{}", self.generation))
            .spawn(move || self.run(target.as_ref()))
    }

    pub fn run(self, target: &dyn ForcedStop) -> WatchdogOutcome {
        // Neither channel ever carries a message; both fire by disconnecting.
        let resolved = select! {
            recv(self.resolved) -> _ => true,
            recv(self.cancel) -> _ => false,
        };
        let outcome = if !resolved {
            WatchdogOutcome::Cancelled
        } else if self.guard.is_server_ready() {
            WatchdogOutcome::Resolved
        } else {
            logger::warn("server cannot be resolved, shutting down");
            if target.force_stop(self.generation) {
                WatchdogOutcome::ForcedStop
            } else {
                WatchdogOutcome::Stale
            }
        };
        logger::breadcrumb(
            BreadcrumbFlags::WATCHDOG,
            format!("cycle {} watchdog exit: {outcome:?}", self.generation),
        );
        outcome
    }
}
