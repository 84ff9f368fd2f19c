use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::env;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fs;
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;
use tunnel_bridge::ffi::BridgeLogSink;
use tunnel_bridge::{
    BridgeSetBreadcrumbMask, BridgeSetLogSink, PointStatus, SupportSet, TunnelPoint,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    install_log_sink();
    BridgeSetBreadcrumbMask(u32::MAX);

    let config_text = fs::read_to_string(&settings.config)
        .map_err(|err| anyhow::anyhow!("reading {}: {err}", settings.config.display()))?;
    tunnel_bridge::validate_config(&config_text)?;

    eprintln!(
        "[standalone] launching tunnel point {} (domain={:?}, prefer_ipv6={})",
        tunnel_bridge::version(),
        settings.domain,
        settings.prefer_ipv6
    );

    let (status_tx, status_rx) = crossbeam_channel::unbounded();
    let support = Arc::new(ConsoleSupport { status_tx });
    let point = TunnelPoint::new(support, false);
    point.set_domain_name(settings.domain.as_str());
    point.set_config(config_text);
    point.run_loop(settings.prefer_ipv6)?;

    println!("[standalone] point running until the server stops resolving (interrupt the process to quit)");
    wait_for_shutdown(&point, &status_rx, settings.stats_tag.as_deref());
    println!("[standalone] point shut down");
    Ok(())
}

fn wait_for_shutdown(point: &TunnelPoint, statuses: &Receiver<String>, stats_tag: Option<&str>) {
    loop {
        match statuses.recv_timeout(STATS_INTERVAL) {
            Ok(status) if status == PointStatus::Shutdown.as_str() => return,
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                if let Some(tag) = stats_tag {
                    let uplink = point.query_stats(tag, "uplink");
                    let downlink = point.query_stats(tag, "downlink");
                    println!("[standalone][stats] {tag}: up={uplink}B down={downlink}B");
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[derive(Debug)]
struct Settings {
    config: PathBuf,
    domain: String,
    prefer_ipv6: bool,
    stats_tag: Option<String>,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut config = None;
        let mut domain = String::new();
        let mut prefer_ipv6 = false;
        let mut stats_tag = None;
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?;
                    config = Some(PathBuf::from(value));
                }
                "--domain" => {
                    domain = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--domain requires a value"))?;
                }
                "--prefer-ipv6" => prefer_ipv6 = true,
                "--stats" => {
                    stats_tag = Some(
                        args.next()
                            .ok_or_else(|| anyhow::anyhow!("--stats requires a value"))?,
                    );
                }
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --config <file>, --domain <host:port>, --prefer-ipv6, --stats <tag>",
                        arg
                    );
                }
            }
        }
        let config = config.ok_or_else(|| anyhow::anyhow!("--config is required"))?;
        Ok(Self {
            config,
            domain,
            prefer_ipv6,
            stats_tag,
        })
    }
}

/// Runs outside any VPN, so every socket is accepted as protected.
struct ConsoleSupport {
    status_tx: Sender<String>,
}

impl SupportSet for ConsoleSupport {
    fn protect(&self, fd: i32) -> bool {
        println!("[standalone][protect] fd {fd}");
        true
    }

    fn on_emit_status(&self, status: &str) {
        println!("[standalone][status] {status}");
        let _ = self.status_tx.send(status.to_string());
    }
}

fn install_log_sink() {
    unsafe extern "C" fn log_sink(
        level: *const c_char,
        message: *const c_char,
        _breadcrumbs: u32,
        _context: *mut c_void,
    ) {
        if message.is_null() {
            return;
        }
        let entry = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        let level = if level.is_null() {
            "info".into()
        } else {
            unsafe { CStr::from_ptr(level) }.to_string_lossy()
        };
        println!("[tunnel][{level}] {entry}");
    }

    let sink = BridgeLogSink {
        log: Some(log_sink),
        context: ptr::null_mut(),
        enabled_breadcrumbs: u32::MAX,
    };
    let level = CString::new("debug").unwrap_or_default();
    unsafe {
        BridgeSetLogSink(&sink, level.as_ptr(), ptr::null_mut());
    }
}
