//! C ABI for embedding hosts
//!
//! The host creates one [`OdmContext`] with [`odm_init`] (or
//! [`odm_init_with_config`]), passes it to every other call, and releases it
//! with [`odm_shutdown`]. The context owns a tokio runtime on which transfers
//! run; every call below returns without waiting on the network.
//!
//! Status codes returned by [`odm_check_status`]:
//!
//! | code     | meaning                                   |
//! |----------|-------------------------------------------|
//! | `-1`     | handle not found                          |
//! | `-2`     | transfer failed, see [`odm_get_error`]    |
//! | `0..=99` | pending or active, whole-percent progress |
//! | `100`    | completed, ready for [`odm_move_file`]    |
//!
//! Strings are null-terminated UTF-8. Strings returned by this module are
//! owned by the caller and must be released with [`odm_string_free`].
//! No function unwinds across the boundary.

use crate::config::DownloaderConfig;
use crate::manager::{DownloadManager, ManagerError};
use crate::models::STATUS_NOT_FOUND;
use libc::{c_char, c_int};
use std::ffi::{CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tokio::runtime::{Builder, Runtime};
use tracing::{error, warn};

/// Handle value returned when a download could not be started.
pub const INVALID_HANDLE: u64 = 0;

/// Opaque state handed to the host.
pub struct OdmContext {
    // Dropped before the runtime it was created on.
    manager: DownloadManager,
    runtime: Runtime,
}

impl OdmContext {
    pub fn new(config: DownloaderConfig) -> Result<Self, ManagerError> {
        config.validate()?;
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name("odm-worker");
        if let Some(threads) = config.worker_threads {
            builder.worker_threads(threads);
        }
        let runtime = builder.build()?;
        let manager = runtime.block_on(DownloadManager::open(&config))?;
        Ok(Self { manager, runtime })
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    /// Runs a short coordinator future to completion on the owned runtime.
    fn run<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

fn guard<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("panic caught at the C boundary");
        fallback
    })
}

/// # Safety
///
/// `ptr` must be null or point to a valid null-terminated string.
unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("rejecting non UTF-8 string from host: {}", e);
            None
        }
    }
}

fn into_c_string(s: &str) -> *mut c_char {
    let clean = s.replace('\0', "");
    CString::new(clean)
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

fn create_context(config: DownloaderConfig) -> *mut OdmContext {
    crate::init_logging(&config.log_filter);
    match OdmContext::new(config) {
        Ok(ctx) => Box::into_raw(Box::new(ctx)),
        Err(e) => {
            error!("odm_init failed: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Creates a context storing its database and temp files under `data_dir`.
/// Returns null on failure.
///
/// # Safety
///
/// `data_dir` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn odm_init(data_dir: *const c_char) -> *mut OdmContext {
    guard(std::ptr::null_mut(), || {
        let mut config = DownloaderConfig::new();
        if let Some(dir) = c_str(data_dir).filter(|d| !d.is_empty()) {
            config = config.data_dir(dir);
        }
        create_context(config)
    })
}

/// Creates a context from a JSON [`DownloaderConfig`]. Returns null on failure.
///
/// # Safety
///
/// `config_json` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn odm_init_with_config(config_json: *const c_char) -> *mut OdmContext {
    guard(std::ptr::null_mut(), || {
        let Some(json) = c_str(config_json) else {
            return std::ptr::null_mut();
        };
        match DownloaderConfig::from_json(json) {
            Ok(config) => create_context(config),
            Err(e) => {
                crate::init_logging(&DownloaderConfig::default().log_filter);
                error!("odm_init_with_config: {}", e);
                std::ptr::null_mut()
            }
        }
    })
}

/// Destroys a context. In-flight transfers are abandoned; their records stay
/// in the store and report as failed ("interrupted") after the next init.
///
/// # Safety
///
/// `ctx` must be null or a pointer returned by an init function that has not
/// been shut down yet.
#[no_mangle]
pub unsafe extern "C" fn odm_shutdown(ctx: *mut OdmContext) {
    if ctx.is_null() {
        return;
    }
    guard((), || drop(Box::from_raw(ctx)));
}

/// Starts downloading `url`; the file is moved to `destination` by
/// [`odm_move_file`]. Returns [`INVALID_HANDLE`] (0) if the request is invalid.
///
/// # Safety
///
/// `ctx` must be a live context; the strings must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn odm_start_download(
    ctx: *mut OdmContext,
    url: *const c_char,
    destination: *const c_char,
) -> u64 {
    guard(INVALID_HANDLE, || {
        let Some(ctx) = ctx.as_ref() else {
            return INVALID_HANDLE;
        };
        let (Some(url), Some(destination)) = (c_str(url), c_str(destination)) else {
            return INVALID_HANDLE;
        };
        match ctx.run(ctx.manager.start(url, destination)) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("odm_start_download rejected {}: {}", url, e);
                INVALID_HANDLE
            }
        }
    })
}

/// # Safety
///
/// `ctx` must be null or a live context.
#[no_mangle]
pub unsafe extern "C" fn odm_check_status(ctx: *mut OdmContext, handle: u64) -> c_int {
    guard(STATUS_NOT_FOUND, || match ctx.as_ref() {
        Some(ctx) => ctx.run(ctx.manager.status(handle)).code(),
        None => STATUS_NOT_FOUND,
    })
}

/// Progress fraction in `0.0..=1.0`, or `-1.0` for failed or unknown handles.
///
/// # Safety
///
/// `ctx` must be null or a live context.
#[no_mangle]
pub unsafe extern "C" fn odm_get_progress(ctx: *mut OdmContext, handle: u64) -> f32 {
    guard(-1.0, || match ctx.as_ref() {
        Some(ctx) => ctx.run(ctx.manager.progress(handle)).unwrap_or(-1.0),
        None => -1.0,
    })
}

/// The error recorded for `handle`, or an empty string. Never null unless
/// allocation fails. Free with [`odm_string_free`].
///
/// # Safety
///
/// `ctx` must be null or a live context.
#[no_mangle]
pub unsafe extern "C" fn odm_get_error(ctx: *mut OdmContext, handle: u64) -> *mut c_char {
    guard(std::ptr::null_mut(), || {
        let message = match ctx.as_ref() {
            Some(ctx) => ctx.run(ctx.manager.error(handle)),
            None => String::new(),
        };
        into_c_string(&message)
    })
}

/// Moves a completed download to `destination`; a null or empty destination
/// uses the one given at start. Returns false, leaving files untouched, on
/// any failure.
///
/// # Safety
///
/// `ctx` must be a live context; `destination` must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn odm_move_file(
    ctx: *mut OdmContext,
    handle: u64,
    destination: *const c_char,
) -> bool {
    guard(false, || {
        let Some(ctx) = ctx.as_ref() else {
            return false;
        };
        let destination = if destination.is_null() {
            ""
        } else {
            match c_str(destination) {
                Some(d) => d,
                None => return false,
            }
        };
        ctx.run(ctx.manager.move_file(handle, Path::new(destination)))
    })
}

/// Deletes the temp file and all bookkeeping for `handle`. Idempotent.
///
/// # Safety
///
/// `ctx` must be null or a live context.
#[no_mangle]
pub unsafe extern "C" fn odm_remove_file(ctx: *mut OdmContext, handle: u64) {
    odm_cleanup(ctx, handle)
}

/// # Safety
///
/// `ctx` must be null or a live context.
#[no_mangle]
pub unsafe extern "C" fn odm_cleanup(ctx: *mut OdmContext, handle: u64) {
    guard((), || {
        if let Some(ctx) = ctx.as_ref() {
            ctx.run(ctx.manager.cleanup(handle));
        }
    })
}

/// Removes finished transfers untouched for `max_age_secs`. Returns the count.
///
/// # Safety
///
/// `ctx` must be null or a live context.
#[no_mangle]
pub unsafe extern "C" fn odm_cleanup_stale(ctx: *mut OdmContext, max_age_secs: u64) -> u32 {
    guard(0, || {
        let Some(ctx) = ctx.as_ref() else {
            return 0;
        };
        let Some(max_age) = i64::try_from(max_age_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
        else {
            return 0;
        };
        match ctx.run(ctx.manager.cleanup_stale(max_age)) {
            Ok(count) => u32::try_from(count).unwrap_or(u32::MAX),
            Err(e) => {
                warn!("odm_cleanup_stale failed: {}", e);
                0
            }
        }
    })
}

/// True if the completed download matches the SHA-256 hex digest.
///
/// # Safety
///
/// `ctx` must be a live context; `sha256_hex` must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn odm_verify_file(
    ctx: *mut OdmContext,
    handle: u64,
    sha256_hex: *const c_char,
) -> bool {
    guard(false, || {
        let (Some(ctx), Some(expected)) = (ctx.as_ref(), c_str(sha256_hex)) else {
            return false;
        };
        match ctx.run(ctx.manager.verify_file(handle, expected)) {
            Ok(matches) => matches,
            Err(e) => {
                warn!("odm_verify_file for transfer {} failed: {}", handle, e);
                false
            }
        }
    })
}

/// Releases a string returned by this library.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by this library, freed at most once.
#[no_mangle]
pub unsafe extern "C" fn odm_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}
