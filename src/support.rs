//! Capabilities the embedding host hands to a point at construction.

use std::fmt;

/// Host services a point relies on. Implementations may be invoked from the
/// caller's thread or from the resolution watchdog thread.
pub trait SupportSet: Send + Sync {
    /// Exempts `fd` from the host's tunnel routing. Returns false when the
    /// host refuses.
    fn protect(&self, fd: i32) -> bool;

    /// Delivers a lifecycle status label to the host. Runs outside the
    /// point's transition lock; calling back into the point is allowed.
    fn on_emit_status(&self, status: &str);
}

/// Status labels emitted through [`SupportSet::on_emit_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointStatus {
    Running,
    Closed,
    Shutdown,
}

impl PointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PointStatus::Running => "Running",
            PointStatus::Closed => "Closed",
            PointStatus::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for PointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
