use super::*;
use crate::config::load_json;
use crate::dns::{ResolveError, ResolveOutcome, Resolver};
use crate::protect::{DomainGuard, ProtectedDialer};
use crate::stats::{counter_name, TrafficDirection};
use crate::test_support::RecordingSupport;
use crossbeam_channel::RecvTimeoutError;
use serde_json::json;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn dialer() -> (Arc<RecordingSupport>, Arc<ProtectedDialer>) {
    let support = Arc::new(RecordingSupport::new());
    let dialer = Arc::new(ProtectedDialer::new(
        Arc::clone(&support) as Arc<dyn crate::support::SupportSet>,
        false,
    ));
    (support, dialer)
}

/// Echoes one connection back to its sender.
fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 1024];
            while let Ok(read) = stream.read(&mut buf) {
                if read == 0 || stream.write_all(&buf[..read]).is_err() {
                    break;
                }
            }
        }
    });
    addr
}

fn relay_config(address: &str, port: u16, extra: serde_json::Value) -> PointConfig {
    let mut value = json!({
        "log": { "loglevel": "debug" },
        "stats": {},
        "inbounds": [
            { "tag": "relay-in", "port": 0, "protocol": "forward",
              "settings": { "outbound": "proxy" } },
            { "tag": "sink-in", "port": 0, "protocol": "forward",
              "settings": { "outbound": "block" } }
        ],
        "outbounds": [
            { "tag": "proxy", "protocol": "forward",
              "settings": { "address": address, "port": port } },
            { "tag": "block", "protocol": "blackhole" }
        ]
    });
    if let (Some(target), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
        target.extend(extra.clone());
    }
    load_json(&value.to_string()).expect("test config is valid")
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn round_trip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(payload).unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).unwrap();
    echoed
}

#[test]
fn registers_counters_per_outbound() {
    let (_, dialer) = dialer();
    let engine = CoreEngine::new(relay_config("127.0.0.1", 9, json!({})), dialer).unwrap();
    let stats = engine.stats().expect("stats enabled");
    assert_eq!(stats.len(), 4);
    assert!(stats
        .get_counter(&counter_name("block", TrafficDirection::Downlink))
        .is_some());
}

#[test]
fn no_stats_object_means_no_store() {
    let (_, dialer) = dialer();
    let config = load_json(r#"{"outbounds":[{"tag":"block","protocol":"blackhole"}]}"#).unwrap();
    let engine = CoreEngine::new(config, dialer).unwrap();
    assert!(engine.stats().is_none());
}

#[test]
fn forward_relay_counts_both_directions() {
    let echo = spawn_echo();
    let (support, dialer) = dialer();
    let mut engine =
        CoreEngine::new(relay_config("127.0.0.1", echo.port(), json!({})), dialer).unwrap();
    engine.start().unwrap();
    let relay_addr = engine.local_addrs()[0];

    assert_eq!(round_trip(relay_addr, b"hello tunnel"), b"hello tunnel");

    let stats = engine.stats().unwrap();
    let uplink = stats
        .get_counter(&counter_name("proxy", TrafficDirection::Uplink))
        .unwrap();
    let downlink = stats
        .get_counter(&counter_name("proxy", TrafficDirection::Downlink))
        .unwrap();
    assert!(wait_for(|| uplink.value() == 12 && downlink.value() == 12));
    assert_eq!(support.protected_fds().len(), 1);
    engine.close().unwrap();
}

/// Knows the loopback address of one name, and only the first time it is
/// asked.
struct OneShotResolver {
    calls: AtomicUsize,
}

impl Resolver for OneShotResolver {
    fn resolve(&self, host: &str) -> Result<ResolveOutcome, ResolveError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 && host == "tunnel.test" {
            Ok(ResolveOutcome {
                addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                ttl: Duration::from_secs(60),
            })
        } else {
            Err(ResolveError::LookupFailed(format!("{host} is unknown here")))
        }
    }
}

#[test]
fn forward_to_server_host_dials_the_resolved_address() {
    let echo = spawn_echo();
    let resolver = Arc::new(OneShotResolver {
        calls: AtomicUsize::new(0),
    });
    let dialer = Arc::new(ProtectedDialer::with_resolver(
        Arc::new(RecordingSupport::new()),
        Arc::clone(&resolver) as Arc<dyn Resolver>,
    ));
    let (_cancel, cancel_rx) = crossbeam_channel::bounded::<()>(0);
    dialer.prepare_resolve_signal();
    let signal = dialer.resolve_signal();
    dialer.prepare_domain(&format!("tunnel.test:{}", echo.port()), cancel_rx, false);
    assert!(matches!(
        signal.recv_timeout(WAIT),
        Err(RecvTimeoutError::Disconnected)
    ));
    assert!(dialer.is_server_ready());

    let mut engine = CoreEngine::new(
        relay_config("tunnel.test", echo.port(), json!({})),
        Arc::clone(&dialer),
    )
    .unwrap();
    engine.start().unwrap();
    let relay_addr = engine.local_addrs()[0];

    assert_eq!(round_trip(relay_addr, b"via server"), b"via server");
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    engine.close().unwrap();
}

#[test]
fn blackhole_closes_immediately() {
    let (_, dialer) = dialer();
    let mut engine = CoreEngine::new(relay_config("127.0.0.1", 9, json!({})), dialer).unwrap();
    engine.start().unwrap();
    let sink_addr = engine.local_addrs()[1];

    let mut client = TcpStream::connect(sink_addr).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    engine.close().unwrap();
}

#[test]
fn bind_failure_fails_start_and_binds_nothing() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let (_, dialer) = dialer();
    let config = load_json(
        &json!({
            "inbounds": [
                { "tag": "ok", "port": 0, "protocol": "forward",
                  "settings": { "outbound": "block" } },
                { "tag": "taken", "port": port, "protocol": "forward",
                  "settings": { "outbound": "block" } }
            ],
            "outbounds": [ { "tag": "block", "protocol": "blackhole" } ]
        })
        .to_string(),
    )
    .unwrap();
    let mut engine = CoreEngine::new(config, dialer).unwrap();

    assert!(matches!(engine.start(), Err(EngineError::Start(_))));
    assert!(engine.local_addrs().is_empty());
}

#[test]
fn close_is_idempotent_and_blocks_restart() {
    let (_, dialer) = dialer();
    let mut engine = CoreEngine::new(relay_config("127.0.0.1", 9, json!({})), dialer).unwrap();
    engine.start().unwrap();
    let addr = engine.local_addrs()[0];
    engine.close().unwrap();
    engine.close().unwrap();
    assert!(engine.local_addrs().is_empty());
    assert!(matches!(engine.start(), Err(EngineError::Start(_))));
    assert!(wait_for(|| TcpStream::connect(addr).is_err()));
}

#[test]
fn hosts_asset_overrides_outbound_name() {
    let echo = spawn_echo();
    let hosts = std::env::temp_dir().join(format!("tb-hosts-{}.txt", std::process::id()));
    std::fs::write(&hosts, "# test table\necho.internal 127.0.0.1\n").unwrap();
    let (_, dialer) = dialer();
    let config = relay_config(
        "echo.internal",
        echo.port(),
        json!({ "hosts": hosts.to_str().unwrap() }),
    );
    let mut engine = CoreEngine::new(config, dialer).unwrap();
    engine.start().unwrap();

    assert_eq!(round_trip(engine.local_addrs()[0], b"ping"), b"ping");
    engine.close().unwrap();
    let _ = std::fs::remove_file(hosts);
}

#[test]
fn malformed_hosts_asset_fails_build() {
    let hosts = std::env::temp_dir().join(format!("tb-badhosts-{}.txt", std::process::id()));
    std::fs::write(&hosts, "only-one-field\n").unwrap();
    let (_, dialer) = dialer();
    let config = relay_config("127.0.0.1", 9, json!({ "hosts": hosts.to_str().unwrap() }));
    assert!(matches!(
        CoreEngine::new(config, dialer),
        Err(EngineError::Build(_))
    ));
    let _ = std::fs::remove_file(hosts);
}

#[test]
fn builder_produces_engine_instances() {
    let (_, dialer) = dialer();
    let builder = CoreEngineBuilder::new(dialer);
    let mut engine = builder
        .build(relay_config("127.0.0.1", 9, json!({})))
        .expect("build succeeds");
    assert!(engine.stats().is_some());
    engine.start().unwrap();
    engine.close().unwrap();
}
