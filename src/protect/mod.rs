//! Pre-resolution of the remote server and socket protection.
//!
//! Every start cycle follows the same order: `prepare_resolve_signal`, the
//! caller subscribes through `resolve_signal`, then `prepare_domain` kicks off
//! the lookup. The resolve signal is a channel that is never written to; it
//! closes once the lookup finished, failed, or was cancelled, which wakes every
//! subscriber at once.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

use crate::dns::{ResolveError, Resolver, SystemResolver};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::support::SupportSet;

const RESOLVE_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Closes when the current resolution attempt is over.
pub type ResolveSignal = Receiver<()>;

/// Domain-protection collaborator driven by the lifecycle.
pub trait DomainGuard: Send + Sync {
    /// Opens a fresh resolve signal for the coming cycle.
    fn prepare_resolve_signal(&self);

    /// Subscribes to the signal opened by the last `prepare_resolve_signal`.
    fn resolve_signal(&self) -> ResolveSignal;

    /// Starts resolving `domain`. The work stops early once `cancel`
    /// disconnects, and the resolve signal closes in every case.
    fn prepare_domain(&self, domain: &str, cancel: Receiver<()>, prefer_ipv6: bool);

    /// Whether the last completed resolution produced a usable server address.
    fn is_server_ready(&self) -> bool;
}

struct ResolveCycle {
    completion: Option<Sender<()>>,
    signal: Receiver<()>,
    server: Arc<OnceCell<SocketAddr>>,
    /// Host part of the domain handed to `prepare_domain`.
    server_host: Option<String>,
    prefer_ipv6: bool,
}

impl ResolveCycle {
    fn open() -> Self {
        let (completion, signal) = crossbeam_channel::bounded(0);
        Self {
            completion: Some(completion),
            signal,
            server: Arc::new(OnceCell::new()),
            server_host: None,
            prefer_ipv6: false,
        }
    }
}

/// Default [`DomainGuard`]: resolves through the platform resolver and hands
/// every outbound socket to the host for protection before connecting.
pub struct ProtectedDialer {
    support: Arc<dyn SupportSet>,
    resolver: Arc<dyn Resolver>,
    cycle: Mutex<ResolveCycle>,
    initial_backoff: Duration,
}

impl ProtectedDialer {
    /// `prefer_external_dns` disables the resolver cache so every lookup
    /// reaches the platform resolver.
    pub fn new(support: Arc<dyn SupportSet>, prefer_external_dns: bool) -> Self {
        let resolver: Arc<dyn Resolver> = if prefer_external_dns {
            Arc::new(SystemResolver::uncached())
        } else {
            Arc::new(SystemResolver::default())
        };
        Self::with_resolver(support, resolver)
    }

    pub fn with_resolver(support: Arc<dyn SupportSet>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            support,
            resolver,
            cycle: Mutex::new(ResolveCycle::open()),
            initial_backoff: INITIAL_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    #[cfg(test)]
    pub(crate) fn server_addr(&self) -> Option<SocketAddr> {
        self.cycle.lock().server.get().copied()
    }

    /// Blocking resolution of an outbound endpoint. The current cycle's
    /// server host is answered from the recorded server address, so relays
    /// dial exactly what the readiness check saw; other hosts go through
    /// the resolver with the cycle's address-family preference.
    pub fn resolve_endpoint(&self, host: &str, port: u16) -> Result<SocketAddr, ResolveError> {
        let (recorded, prefer_ipv6) = {
            let cycle = self.cycle.lock();
            let recorded = cycle
                .server_host
                .as_deref()
                .filter(|server_host| server_host.eq_ignore_ascii_case(host))
                .and_then(|_| cycle.server.get().copied());
            (recorded, cycle.prefer_ipv6)
        };
        if let Some(server) = recorded {
            logger::breadcrumb(
                BreadcrumbFlags::DNS,
                format!("{host} answered from the resolved server {}", server.ip()),
            );
            return Ok(SocketAddr::new(server.ip(), port));
        }
        self.resolver
            .resolve(host)?
            .pick(prefer_ipv6)
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| ResolveError::LookupFailed(format!("no address for {host}")))
    }

    pub fn protect_socket(&self, fd: i32) -> bool {
        let protected = self.support.protect(fd);
        if !protected {
            logger::rate_limited_error(
                ErrorCategory::ProtectFailed,
                format!("host refused to protect fd {fd}"),
            );
        }
        protected
    }

    /// Connects to `addr` on a socket the host protected first.
    pub async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            if !self.protect_socket(socket.as_raw_fd()) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "socket protection refused",
                ));
            }
        }
        socket.connect(addr).await
    }
}

impl DomainGuard for ProtectedDialer {
    fn prepare_resolve_signal(&self) {
        *self.cycle.lock() = ResolveCycle::open();
    }

    fn resolve_signal(&self) -> ResolveSignal {
        self.cycle.lock().signal.clone()
    }

    fn prepare_domain(&self, domain: &str, cancel: Receiver<()>, prefer_ipv6: bool) {
        let (completion, server) = {
            let mut cycle = self.cycle.lock();
            cycle.prefer_ipv6 = prefer_ipv6;
            (cycle.completion.take(), Arc::clone(&cycle.server))
        };
        let Some(completion) = completion else {
            logger::warn("prepare_domain called twice for one resolve signal");
            return;
        };
        let Some((host, port)) = split_domain(domain) else {
            logger::warn(format!("cannot parse server domain {domain:?}"));
            drop(completion);
            return;
        };
        self.cycle.lock().server_host = Some(host.clone());

        let task = ResolveTask {
            host,
            port,
            prefer_ipv6,
            resolver: Arc::clone(&self.resolver),
            cancel,
            server,
            initial_backoff: self.initial_backoff,
        };
        let spawned = thread::Builder::new()
            .name("domain-resolve".into())
            .spawn(move || {
                task.run();
                drop(completion);
            });
        if let Err(error) = spawned {
            // The closure and the completion sender inside it are gone, so
            // the signal is already closed and the cycle reads as not ready.
            logger::error(format!("failed to spawn resolver thread: {error}"));
        }
    }

    fn is_server_ready(&self) -> bool {
        self.cycle.lock().server.get().is_some()
    }
}

struct ResolveTask {
    host: String,
    port: u16,
    prefer_ipv6: bool,
    resolver: Arc<dyn Resolver>,
    cancel: Receiver<()>,
    server: Arc<OnceCell<SocketAddr>>,
    initial_backoff: Duration,
}

impl ResolveTask {
    fn run(self) {
        let mut backoff = self.initial_backoff;
        for attempt in 1..=RESOLVE_ATTEMPTS {
            if self.cancelled() {
                logger::breadcrumb(BreadcrumbFlags::DNS, "resolution cancelled");
                return;
            }
            match self.resolver.resolve(&self.host) {
                Ok(outcome) => {
                    if let Some(ip) = outcome.pick(self.prefer_ipv6) {
                        let target = SocketAddr::new(ip, self.port);
                        let _ = self.server.set(target);
                        logger::breadcrumb(
                            BreadcrumbFlags::DNS,
                            format!("{} resolved to {target}", self.host),
                        );
                        return;
                    }
                }
                Err(ResolveError::Unsupported) => {
                    logger::warn(format!("server name {:?} is not resolvable", self.host));
                    return;
                }
                Err(ResolveError::LookupFailed(reason)) => {
                    logger::breadcrumb(
                        BreadcrumbFlags::DNS,
                        format!(
                            "resolving {} failed (attempt {attempt}/{RESOLVE_ATTEMPTS}): {reason}",
                            self.host
                        ),
                    );
                }
            }
            if attempt == RESOLVE_ATTEMPTS {
                break;
            }
            match self.cancel.recv_timeout(backoff) {
                Err(RecvTimeoutError::Timeout) => backoff = backoff.saturating_mul(2),
                _ => {
                    logger::breadcrumb(BreadcrumbFlags::DNS, "resolution cancelled");
                    return;
                }
            }
        }
        logger::warn(format!(
            "giving up on {} after {RESOLVE_ATTEMPTS} attempts",
            self.host
        ));
    }

    fn cancelled(&self) -> bool {
        !matches!(self.cancel.try_recv(), Err(TryRecvError::Empty))
    }
}

/// Splits `host:port`, `[v6]:port`, or a bare host (port 0).
pub fn split_domain(domain: &str) -> Option<(String, u16)> {
    let trimmed = domain.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        return Some((addr.ip().to_string(), addr.port()));
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Some((ip.to_string(), 0));
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port.parse::<u16>().ok()?;
            Some((host.to_string(), port))
        }
        Some(_) => None,
        None => Some((trimmed.to_string(), 0)),
    }
}
