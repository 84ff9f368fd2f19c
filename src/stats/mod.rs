//! Traffic counters owned by an engine, and the read-and-reset query the host
//! polls while the point runs.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::logger::{self, BreadcrumbFlags};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrafficDirection {
    Uplink,
    Downlink,
}

impl TrafficDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TrafficDirection::Uplink => "uplink",
            TrafficDirection::Downlink => "downlink",
        }
    }
}

impl FromStr for TrafficDirection {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "uplink" => Ok(TrafficDirection::Uplink),
            "downlink" => Ok(TrafficDirection::Downlink),
            _ => Err(()),
        }
    }
}

/// Store key for the outbound counter `(tag, direction)`.
pub fn counter_name(tag: &str, direction: TrafficDirection) -> String {
    format!("outbound>>>{tag}>>>traffic>>>{}", direction.as_str())
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Replaces the value, returning what it held before.
    pub fn set(&self, value: i64) -> i64 {
        self.value.swap(value, Ordering::AcqRel)
    }
}

/// Named counter registry. Counters are registered while the engine is being
/// built and only read or reset afterwards.
#[derive(Debug, Default)]
pub struct StatsManager {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
}

impl StatsManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the counter registered under `name`, creating it on first use.
    pub fn register_counter(&self, name: &str) -> Arc<Counter> {
        if let Some(existing) = self.counters.read().get(name) {
            return Arc::clone(existing);
        }
        let mut counters = self.counters.write();
        Arc::clone(counters.entry(name.to_string()).or_default())
    }

    pub fn get_counter(&self, name: &str) -> Option<Arc<Counter>> {
        self.counters.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host-facing stats access. Holds the running engine's store, if any; the
/// handle is swapped only when a start or stop completes, so a query never
/// waits on a lifecycle transition.
#[derive(Debug, Default)]
pub struct StatsQuery {
    handle: RwLock<Option<Arc<StatsManager>>>,
}

impl StatsQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, manager: Option<Arc<StatsManager>>) {
        let registered = manager.as_ref().map(|m| m.len()).unwrap_or(0);
        *self.handle.write() = manager;
        logger::breadcrumb(
            BreadcrumbFlags::STATS,
            format!("stats handle attached ({registered} counters)"),
        );
    }

    pub(crate) fn detach(&self) {
        self.handle.write().take();
        logger::breadcrumb(BreadcrumbFlags::STATS, "stats handle detached");
    }

    #[cfg(test)]
    pub(crate) fn is_attached(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Fetches and zeroes the counter for `(tag, direction)`. Anything that
    /// cannot be answered (no engine, unknown direction, unknown counter)
    /// reads as zero.
    pub fn query(&self, tag: &str, direction: &str) -> i64 {
        let Ok(direction) = direction.parse::<TrafficDirection>() else {
            return 0;
        };
        let manager = match self.handle.read().as_ref() {
            Some(manager) => Arc::clone(manager),
            None => return 0,
        };
        manager
            .get_counter(&counter_name(tag, direction))
            .map(|counter| counter.set(0))
            .unwrap_or(0)
    }
}
