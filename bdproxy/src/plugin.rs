//! Dynamically-loaded I/O provider ABI (spec.md §6 "Plugin ABI").
//!
//! Only the four-callback interface is specified; the provider itself is
//! an external collaborator. The loader is a thin hand-rolled `dlopen`
//! wrapper rather than a `libloading` dependency — nothing in the corpus
//! pulls in a loader crate, every unsafe-FFI need elsewhere is met with
//! raw `libc` calls, so the plugin loader follows suit.

use std::ffi::{c_void, CString};

use crate::error::{ProxyError, Result};

/// Sentinel handle value meaning "open failed".
pub const INVALID_HANDLE: u64 = u64::MAX;

type ReadFn = unsafe extern "C" fn(handle: u64, buf: *mut u8, len: u64, off: u64) -> i64;
type WriteFn = unsafe extern "C" fn(handle: u64, buf: *const u8, len: u64, off: u64) -> i64;
type CloseFn = unsafe extern "C" fn(handle: u64) -> libc::c_int;

/// `open(name, read_only, out_read, out_write, out_close, out_size) -> handle`
/// — the single entry point a plugin exports, per spec.md §6. It hands
/// back the three per-session callbacks by reference rather than by
/// fixed symbol name, so one shared object can serve multiple sessions
/// with different callback sets if it wants to.
type OpenFn = unsafe extern "C" fn(
    name: *const libc::c_char,
    read_only: libc::c_int,
    out_read: *mut Option<ReadFn>,
    out_write: *mut Option<WriteFn>,
    out_close: *mut Option<CloseFn>,
    out_size: *mut u64,
) -> u64;

/// An open session against a loaded plugin. Holds the library handle so
/// it outlives every call made through the resolved symbols, and calls
/// the plugin's close callback (C1's `close() -> status`) on drop.
pub struct PluginSession {
    lib: *mut c_void,
    handle: u64,
    read_fn: ReadFn,
    write_fn: WriteFn,
    close_fn: CloseFn,
    reported_size: Option<u64>,
}

// The plugin contract requires the four callbacks to be safely callable
// from a single thread at a time, which matches this server's one
// in-flight request at a time invariant (spec.md §5).
unsafe impl Send for PluginSession {}

impl PluginSession {
    /// `spec` is `lib;entry` as documented for `--dll` (spec.md §6); the
    /// entry name selects which backing image / session the plugin
    /// should open, the way a path selects a file for the file-backed
    /// variant.
    pub fn open(spec: &str, read_only: bool) -> Result<Self> {
        let (lib_path, entry) = spec
            .split_once(';')
            .ok_or_else(|| ProxyError::BadFormat(format!("--dll expects lib;entry, got {spec:?}")))?;

        let lib_cpath = CString::new(lib_path)
            .map_err(|_| ProxyError::BadFormat("plugin path contains NUL".into()))?;
        let lib = unsafe { libc::dlopen(lib_cpath.as_ptr(), libc::RTLD_NOW) };
        if lib.is_null() {
            return Err(ProxyError::AllocFailure(format!(
                "dlopen({lib_path:?}) failed"
            )));
        }

        let open_fn: OpenFn = match (unsafe { resolve::<OpenFn>(lib, "open") }) {
            Ok(f) => f,
            Err(e) => {
                unsafe { libc::dlclose(lib) };
                return Err(e);
            }
        };

        let entry_c = CString::new(entry)
            .map_err(|_| ProxyError::BadFormat("plugin entry contains NUL".into()))?;
        let mut out_read: Option<ReadFn> = None;
        let mut out_write: Option<WriteFn> = None;
        let mut out_close: Option<CloseFn> = None;
        let mut out_size: u64 = 0;
        let handle = unsafe {
            open_fn(
                entry_c.as_ptr(),
                read_only as libc::c_int,
                &mut out_read,
                &mut out_write,
                &mut out_close,
                &mut out_size,
            )
        };
        if handle == INVALID_HANDLE {
            unsafe { libc::dlclose(lib) };
            return Err(ProxyError::BadFormat(format!(
                "plugin refused to open entry {entry:?}"
            )));
        }
        let (Some(read_fn), Some(write_fn), Some(close_fn)) = (out_read, out_write, out_close)
        else {
            unsafe { libc::dlclose(lib) };
            return Err(ProxyError::BadFormat(
                "plugin open succeeded but did not supply all callbacks".into(),
            ));
        };

        Ok(PluginSession {
            lib,
            handle,
            read_fn,
            write_fn,
            close_fn,
            reported_size: (out_size != 0).then_some(out_size),
        })
    }

    pub fn reported_size(&self) -> Option<u64> {
        self.reported_size
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = unsafe { (self.read_fn)(self.handle, buf.as_mut_ptr(), buf.len() as u64, offset) };
        if n < 0 {
            return Err(ProxyError::BackingIo(std::io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let n = unsafe { (self.write_fn)(self.handle, buf.as_ptr(), buf.len() as u64, offset) };
        if n < 0 {
            return Err(ProxyError::BackingIo(std::io::Error::last_os_error()));
        }
        Ok(n as usize)
    }
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        unsafe {
            (self.close_fn)(self.handle);
            libc::dlclose(self.lib);
        }
    }
}

unsafe fn resolve<T: Copy>(lib: *mut c_void, name: &str) -> Result<T> {
    let cname = CString::new(name).unwrap();
    let sym = libc::dlsym(lib, cname.as_ptr());
    if sym.is_null() {
        return Err(ProxyError::BadFormat(format!("plugin missing symbol {name}")));
    }
    // SAFETY: caller guarantees T is one of the ABI function pointer
    // typedefs above, which are all the same size as *mut c_void.
    Ok(std::mem::transmute_copy(&sym))
}
