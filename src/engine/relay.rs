use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use super::{Engine, EngineBuilder, EngineError};
use crate::assets;
use crate::config::{PointConfig, Protocol};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory, LogLevel};
use crate::protect::ProtectedDialer;
use crate::stats::{counter_name, Counter, StatsManager, TrafficDirection};

const RELAY_BUFFER: usize = 16 * 1024;
const ACCEPT_RETRY: Duration = Duration::from_millis(50);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds [`CoreEngine`] instances that dial through a shared protected dialer.
pub struct CoreEngineBuilder {
    dialer: Arc<ProtectedDialer>,
}

impl CoreEngineBuilder {
    pub fn new(dialer: Arc<ProtectedDialer>) -> Self {
        Self { dialer }
    }
}

impl EngineBuilder for CoreEngineBuilder {
    fn build(&self, config: PointConfig) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(CoreEngine::new(config, Arc::clone(&self.dialer))?))
    }
}

enum OutboundKind {
    Forward { address: String, port: u16 },
    Blackhole,
}

struct Outbound {
    tag: String,
    kind: OutboundKind,
    uplink: Option<Arc<Counter>>,
    downlink: Option<Arc<Counter>>,
}

struct Route {
    inbound: String,
    listen: SocketAddr,
    outbound: Arc<Outbound>,
}

/// Shared by every connection accepted on one inbound.
struct RelayContext {
    inbound: String,
    outbound: Arc<Outbound>,
    dialer: Arc<ProtectedDialer>,
    hosts: Arc<HashMap<String, IpAddr>>,
    log_level: Option<LogLevel>,
}

/// Plain TCP relay engine: one listener per inbound, each connection copied
/// to the inbound's outbound with per-outbound byte counters.
pub struct CoreEngine {
    runtime: Option<Runtime>,
    routes: Vec<Route>,
    dialer: Arc<ProtectedDialer>,
    hosts: Arc<HashMap<String, IpAddr>>,
    stats: Option<Arc<StatsManager>>,
    log_level: Option<LogLevel>,
    listeners: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl CoreEngine {
    pub fn new(config: PointConfig, dialer: Arc<ProtectedDialer>) -> Result<Self, EngineError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(2)
            .thread_name("tunnel-engine")
            .enable_io()
            .enable_time()
            .build()?;

        let stats = config.stats_enabled().then(StatsManager::new);
        let hosts = match config.hosts.as_deref() {
            Some(name) => load_hosts(name)?,
            None => HashMap::new(),
        };

        let mut outbounds: HashMap<String, Arc<Outbound>> = HashMap::new();
        for outbound in &config.outbounds {
            let kind = match outbound.protocol {
                Protocol::Forward => OutboundKind::Forward {
                    address: outbound.settings.address.clone().unwrap_or_default(),
                    port: outbound.settings.port.unwrap_or(0),
                },
                Protocol::Blackhole => OutboundKind::Blackhole,
            };
            let counter = |direction| {
                stats
                    .as_ref()
                    .map(|manager| manager.register_counter(&counter_name(&outbound.tag, direction)))
            };
            outbounds.insert(
                outbound.tag.clone(),
                Arc::new(Outbound {
                    tag: outbound.tag.clone(),
                    kind,
                    uplink: counter(TrafficDirection::Uplink),
                    downlink: counter(TrafficDirection::Downlink),
                }),
            );
        }

        let mut routes = Vec::with_capacity(config.inbounds.len());
        for inbound in &config.inbounds {
            let target = inbound.settings.outbound.as_deref().unwrap_or_default();
            let outbound = outbounds.get(target).cloned().ok_or_else(|| {
                EngineError::Build(format!("inbound '{}' has no outbound '{target}'", inbound.tag))
            })?;
            routes.push(Route {
                inbound: inbound.tag.clone(),
                listen: SocketAddr::new(inbound.listen, inbound.port),
                outbound,
            });
        }

        logger::breadcrumb(
            BreadcrumbFlags::ENGINE,
            format!(
                "core engine built ({} routes, {} outbounds)",
                routes.len(),
                outbounds.len()
            ),
        );

        Ok(Self {
            runtime: Some(runtime),
            routes,
            dialer,
            hosts: Arc::new(hosts),
            stats,
            log_level: config.log.level(),
            listeners: Vec::new(),
            local_addrs: Vec::new(),
        })
    }

    /// Bound listener addresses, in inbound order. Empty until started.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }
}

impl Engine for CoreEngine {
    fn start(&mut self) -> Result<(), EngineError> {
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(EngineError::Start("engine already closed".into()));
        };
        if !self.listeners.is_empty() {
            return Err(EngineError::Start("engine already started".into()));
        }

        // Bind everything first so a failure leaves nothing listening.
        let mut bound = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let listener = std::net::TcpListener::bind(route.listen).map_err(|error| {
                EngineError::Start(format!("bind {} for '{}': {error}", route.listen, route.inbound))
            })?;
            listener.set_nonblocking(true)?;
            bound.push(listener);
        }

        let _enter = runtime.enter();
        let mut listeners = Vec::with_capacity(bound.len());
        let mut local_addrs = Vec::with_capacity(bound.len());
        for (route, std_listener) in self.routes.iter().zip(bound) {
            local_addrs.push(std_listener.local_addr()?);
            let listener = TcpListener::from_std(std_listener)?;
            let context = Arc::new(RelayContext {
                inbound: route.inbound.clone(),
                outbound: Arc::clone(&route.outbound),
                dialer: Arc::clone(&self.dialer),
                hosts: Arc::clone(&self.hosts),
                log_level: self.log_level,
            });
            listeners.push(runtime.spawn(accept_loop(listener, context)));
        }

        for (route, addr) in self.routes.iter().zip(&local_addrs) {
            super::log(
                self.log_level,
                LogLevel::Info,
                &format!("inbound '{}' listening on {addr} -> '{}'", route.inbound, route.outbound.tag),
            );
        }
        self.listeners = listeners;
        self.local_addrs = local_addrs;
        Ok(())
    }

    fn close(&mut self) -> Result<(), EngineError> {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        self.local_addrs.clear();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
            logger::breadcrumb(BreadcrumbFlags::ENGINE, "core engine closed");
        }
        Ok(())
    }

    fn stats(&self) -> Option<Arc<StatsManager>> {
        self.stats.clone()
    }
}

impl Drop for CoreEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<RelayContext>) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                super::log(
                    context.log_level,
                    LogLevel::Debug,
                    &format!("'{}' accepted {peer}", context.inbound),
                );
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    if let Err(error) = relay(client, &context).await {
                        logger::rate_limited_error(
                            ErrorCategory::RelayFailed,
                            format!("relay {peer} via '{}': {error}", context.outbound.tag),
                        );
                    }
                });
            }
            Err(error) => {
                logger::rate_limited_error(
                    ErrorCategory::RelayFailed,
                    format!("accept on '{}' failed: {error}", context.inbound),
                );
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
}

async fn relay(mut client: TcpStream, context: &RelayContext) -> io::Result<()> {
    let (address, port) = match &context.outbound.kind {
        OutboundKind::Blackhole => {
            let _ = client.shutdown().await;
            return Ok(());
        }
        OutboundKind::Forward { address, port } => (address.as_str(), *port),
    };

    let target = resolve_target(context, address, port).await?;
    let remote = context.dialer.dial_tcp(target).await.map_err(|error| {
        logger::rate_limited_error(
            ErrorCategory::DialFailed,
            format!("dial {target} for '{}': {error}", context.outbound.tag),
        );
        error
    })?;

    let (mut client_read, mut client_write) = client.into_split();
    let (mut remote_read, mut remote_write) = remote.into_split();
    let uplink = pump(&mut client_read, &mut remote_write, context.outbound.uplink.as_deref());
    let downlink = pump(&mut remote_read, &mut client_write, context.outbound.downlink.as_deref());
    let (sent, received) = tokio::join!(uplink, downlink);
    let (sent, received) = (sent?, received?);
    super::log(
        context.log_level,
        LogLevel::Debug,
        &format!("'{}' closed ({sent} up / {received} down)", context.outbound.tag),
    );
    Ok(())
}

async fn resolve_target(context: &RelayContext, address: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    if let Some(ip) = context.hosts.get(&address.to_ascii_lowercase()) {
        return Ok(SocketAddr::new(*ip, port));
    }
    let dialer = Arc::clone(&context.dialer);
    let host = address.to_string();
    tokio::task::spawn_blocking(move || dialer.resolve_endpoint(&host, port))
        .await
        .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?
        .map_err(|error| io::Error::new(io::ErrorKind::NotFound, error))
}

/// Copies until EOF, then half-closes the writer.
async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: Option<&Counter>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..read]).await?;
        if let Some(counter) = counter {
            counter.add(read as i64);
        }
        total += read as u64;
    }
}

/// Reads `name address` lines; `#` starts a comment.
fn load_hosts(name: &str) -> Result<HashMap<String, IpAddr>, EngineError> {
    let file = assets::open_asset(name)
        .map_err(|error| EngineError::Build(format!("hosts asset '{name}': {error}")))?;
    let mut hosts = HashMap::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let content = line.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            continue;
        }
        let mut fields = content.split_whitespace();
        let (Some(host), Some(address), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(EngineError::Build(format!(
                "hosts asset '{name}' line {}: expected 'name address'",
                index + 1
            )));
        };
        let ip = address.parse::<IpAddr>().map_err(|_| {
            EngineError::Build(format!(
                "hosts asset '{name}' line {}: bad address '{address}'",
                index + 1
            ))
        })?;
        hosts.insert(host.to_ascii_lowercase(), ip);
    }
    Ok(hosts)
}
