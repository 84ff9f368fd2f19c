use super::{ResolveError, ResolveOutcome, Resolver};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

const CACHE_CAPACITY: usize = 64;
const MAX_HOST_LENGTH: usize = 255;
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Blocking resolver backed by the platform `getaddrinfo` implementation.
///
/// Answers are cached per host for `ttl`. When the cache is full the entry
/// closest to expiry is dropped. [`SystemResolver::uncached`] skips the cache
/// entirely so every server lookup observes current DNS.
#[derive(Debug)]
pub struct SystemResolver {
    cache: Option<RwLock<HashMap<String, (Instant, Vec<IpAddr>)>>>,
    ttl: Duration,
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl SystemResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Some(RwLock::new(HashMap::new())),
            ttl: ttl.max(Duration::from_secs(1)),
        }
    }

    pub fn uncached() -> Self {
        Self {
            cache: None,
            ttl: DEFAULT_TTL,
        }
    }

    fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.as_ref()?.read();
        match cache.get(host) {
            Some((expires_at, addresses)) if *expires_at > Instant::now() => {
                Some(addresses.clone())
            }
            _ => None,
        }
    }

    fn remember(&self, host: &str, addresses: &[IpAddr]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let now = Instant::now();
        let mut cache = cache.write();
        cache.retain(|_, (expires_at, _)| *expires_at > now);
        if cache.len() >= CACHE_CAPACITY && !cache.contains_key(host) {
            let soonest = cache
                .iter()
                .min_by_key(|(_, (expires_at, _))| *expires_at)
                .map(|(key, _)| key.clone());
            if let Some(key) = soonest {
                cache.remove(&key);
            }
        }
        cache.insert(host.to_string(), (now + self.ttl, addresses.to_vec()));
    }

    fn getaddrinfo(host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        let resolved = (host, 0)
            .to_socket_addrs()
            .map_err(|error| ResolveError::LookupFailed(error.to_string()))?;
        for ip in resolved.map(|addr| addr.ip()) {
            if !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }
        if addresses.is_empty() {
            return Err(ResolveError::LookupFailed(format!("no addresses for {host}")));
        }
        Ok(addresses)
    }

    #[cfg(test)]
    fn cached_hosts(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.read().len())
    }
}

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError> {
        let host = host.trim().trim_end_matches('.');
        if host.is_empty() || host.len() > MAX_HOST_LENGTH {
            return Err(ResolveError::Unsupported);
        }
        let addresses = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![ip]
        } else if let Some(addresses) = self.cached(host) {
            addresses
        } else {
            let addresses = Self::getaddrinfo(host)?;
            self.remember(host, &addresses);
            addresses
        };
        Ok(ResolveOutcome {
            addresses,
            ttl: self.ttl,
        })
    }
}
