use crate::logger::{self, ErrorCategory};
use crate::support::SupportSet;
use std::ffi::{c_char, c_void, CStr, CString};

pub type ProtectFn = unsafe extern "C" fn(fd: i32, context: *mut c_void) -> bool;
pub type EmitStatusFn = unsafe extern "C" fn(status: *const c_char, context: *mut c_void);

/// Callbacks installed by the host service (`include/tunnel_bridge.h`).
///
/// The host keeps `context` alive for as long as the point that received
/// this set exists. `on_emit_status` runs outside the point's transition
/// lock, so it may call `BridgePointRunLoop` / `BridgePointStopLoop` on the
/// same point, for instance to tear the service down on `Shutdown`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeSupportSet {
    pub protect: ProtectFn,
    pub on_emit_status: EmitStatusFn,
    pub context: *mut c_void,
}

unsafe impl Send for BridgeSupportSet {}
unsafe impl Sync for BridgeSupportSet {}

impl SupportSet for BridgeSupportSet {
    fn protect(&self, fd: i32) -> bool {
        unsafe { (self.protect)(fd, self.context) }
    }

    fn on_emit_status(&self, status: &str) {
        let Ok(status_c) = CString::new(status) else {
            logger::rate_limited_error(
                ErrorCategory::CallbackError,
                format!("status {status:?} contains an interior NUL"),
            );
            return;
        };
        unsafe { (self.on_emit_status)(status_c.as_ptr(), self.context) }
    }
}

#[repr(C)]
pub struct BridgeLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

/// Borrows a NUL-terminated UTF-8 argument. Null or non-UTF-8 input yields `None`.
///
/// # Safety
/// `value` must be null or point to a NUL-terminated string that outlives `'a`.
pub unsafe fn str_arg<'a>(value: *const c_char) -> Option<&'a str> {
    if value.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(value) }.to_str().ok()
}
