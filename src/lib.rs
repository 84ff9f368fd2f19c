#![deny(unsafe_op_in_unsafe_fn)]

pub mod assets;
pub mod config;
pub mod dns;
pub mod engine;
pub mod ffi;
pub mod lifecycle;
pub mod logger;
pub mod point;
pub mod protect;
pub mod stats;
pub mod support;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use crate::lifecycle::{Phase, StartError};
pub use crate::point::{validate_config, version, TunnelPoint};
pub use crate::support::{PointStatus, SupportSet};

use crate::ffi::{str_arg, BridgeLogSink, BridgeSupportSet};
use crate::logger::BreadcrumbFlags;
use once_cell::sync::Lazy;
use std::ffi::CString;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::sync::Arc;

pub const BRIDGE_OK: i32 = 0;
pub const BRIDGE_ERR_NULL_POINT: i32 = -1;
pub const BRIDGE_ERR_BAD_STRING: i32 = -2;
pub const BRIDGE_ERR_CONFIG: i32 = -3;
pub const BRIDGE_ERR_ENGINE_START: i32 = -4;

static VERSION: Lazy<CString> =
    Lazy::new(|| CString::new(version()).unwrap_or_else(|_| CString::default()));

fn start_error_code(error: &StartError) -> i32 {
    if error.is_config_error() {
        BRIDGE_ERR_CONFIG
    } else {
        BRIDGE_ERR_ENGINE_START
    }
}

/// Creates a point. `support` is copied; its `context` must stay valid until
/// the point is freed. Returns null when `support` is null.
#[no_mangle]
pub unsafe extern "C" fn BridgeNewPoint(
    support: *const BridgeSupportSet,
    prefer_external_dns: bool,
) -> *mut TunnelPoint {
    let Some(support) = (unsafe { support.as_ref() }) else {
        logger::error("BridgeNewPoint: support set missing");
        return std::ptr::null_mut();
    };
    logger::breadcrumb(
        BreadcrumbFlags::FFI,
        format!("BridgeNewPoint (prefer_external_dns={prefer_external_dns})"),
    );
    let point = TunnelPoint::new(Arc::new(*support), prefer_external_dns);
    Box::into_raw(Box::new(point))
}

/// Stops the point if it is running, then frees it.
#[no_mangle]
pub unsafe extern "C" fn BridgeFreePoint(point: *mut TunnelPoint) {
    if let Some(point) = NonNull::new(point) {
        unsafe {
            drop(Box::from_raw(point.as_ptr()));
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgePointSetDomainName(
    point: *mut TunnelPoint,
    domain_name: *const c_char,
) -> i32 {
    let Some(point) = NonNull::new(point) else {
        return BRIDGE_ERR_NULL_POINT;
    };
    let Some(domain_name) = (unsafe { str_arg(domain_name) }) else {
        return BRIDGE_ERR_BAD_STRING;
    };
    unsafe { point.as_ref() }.set_domain_name(domain_name);
    BRIDGE_OK
}

#[no_mangle]
pub unsafe extern "C" fn BridgePointSetConfig(
    point: *mut TunnelPoint,
    config_text: *const c_char,
) -> i32 {
    let Some(point) = NonNull::new(point) else {
        return BRIDGE_ERR_NULL_POINT;
    };
    let Some(config_text) = (unsafe { str_arg(config_text) }) else {
        return BRIDGE_ERR_BAD_STRING;
    };
    unsafe { point.as_ref() }.set_config(config_text);
    BRIDGE_OK
}

#[no_mangle]
pub unsafe extern "C" fn BridgePointRunLoop(point: *mut TunnelPoint, prefer_ipv6: bool) -> i32 {
    let Some(point) = NonNull::new(point) else {
        return BRIDGE_ERR_NULL_POINT;
    };
    match unsafe { point.as_ref() }.run_loop(prefer_ipv6) {
        Ok(()) => BRIDGE_OK,
        Err(error) => {
            logger::error(format!("BridgePointRunLoop error: {error}"));
            start_error_code(&error)
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgePointStopLoop(point: *mut TunnelPoint) -> i32 {
    let Some(point) = NonNull::new(point) else {
        return BRIDGE_ERR_NULL_POINT;
    };
    unsafe { point.as_ref() }.stop_loop();
    BRIDGE_OK
}

#[no_mangle]
pub unsafe extern "C" fn BridgePointIsRunning(point: *mut TunnelPoint) -> bool {
    match NonNull::new(point) {
        Some(point) => unsafe { point.as_ref() }.is_running(),
        None => false,
    }
}

/// Read-and-reset of a traffic counter. Zero for null or invalid arguments.
#[no_mangle]
pub unsafe extern "C" fn BridgePointQueryStats(
    point: *mut TunnelPoint,
    tag: *const c_char,
    direction: *const c_char,
) -> i64 {
    let Some(point) = NonNull::new(point) else {
        return 0;
    };
    let (Some(tag), Some(direction)) = (unsafe { str_arg(tag) }, unsafe { str_arg(direction) })
    else {
        return 0;
    };
    unsafe { point.as_ref() }.query_stats(tag, direction)
}

#[no_mangle]
pub unsafe extern "C" fn BridgeTestConfig(config_text: *const c_char) -> i32 {
    let Some(config_text) = (unsafe { str_arg(config_text) }) else {
        return BRIDGE_ERR_BAD_STRING;
    };
    match validate_config(config_text) {
        Ok(()) => BRIDGE_OK,
        Err(error) => {
            logger::breadcrumb(BreadcrumbFlags::CONFIG, format!("config rejected: {error}"));
            BRIDGE_ERR_CONFIG
        }
    }
}

/// Static, NUL-terminated; the host must not free it.
#[no_mangle]
pub extern "C" fn BridgeGetVersion() -> *const c_char {
    VERSION.as_ptr()
}

/// Either argument may be null, which is treated as empty.
#[no_mangle]
pub unsafe extern "C" fn BridgeSetAssetsPath(
    env_path: *const c_char,
    assets_path: *const c_char,
) -> bool {
    let env_path = if env_path.is_null() {
        Some("")
    } else {
        unsafe { str_arg(env_path) }
    };
    let assets_path = if assets_path.is_null() {
        Some("")
    } else {
        unsafe { str_arg(assets_path) }
    };
    let (Some(env_path), Some(assets_path)) = (env_path, assets_path) else {
        return false;
    };
    assets::set_assets_path(env_path, assets_path);
    true
}

#[no_mangle]
pub unsafe extern "C" fn BridgeSetLogSink(
    sink: *const BridgeLogSink,
    level: *const c_char,
    _error: *mut *mut std::ffi::c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = unsafe { str_arg(level) };
    logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn BridgeSetBreadcrumbMask(mask: u32) {
    logger::set_breadcrumb_mask(mask);
}

#[no_mangle]
pub extern "C" fn BridgeEnsureLinked() -> bool {
    true
}
