//! Name resolution used to pre-resolve the remote server before and while the
//! engine runs.

mod system;

pub use system::SystemResolver;

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported hostname")]
    Unsupported,
    #[error("lookup failed: {0}")]
    LookupFailed(String),
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError>;
}

#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub addresses: Vec<IpAddr>,
    pub ttl: Duration,
}

impl ResolveOutcome {
    /// First address of the preferred family, falling back to whatever
    /// the lookup produced first.
    pub fn pick(&self, prefer_ipv6: bool) -> Option<IpAddr> {
        self.addresses
            .iter()
            .copied()
            .find(|addr| addr.is_ipv6() == prefer_ipv6)
            .or_else(|| self.addresses.first().copied())
    }
}
