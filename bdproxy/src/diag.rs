//! C8 diagnostics sink and C9 fatal handler.
//!
//! The sink itself is just the `log` facade (every binary in the
//! corpus this was grown from calls `env_logger::init()` once at
//! startup and logs through `log::{info,warn,error}` from then on); what
//! this module adds is the errno-placeholder convention: a log template
//! that ends in `{errno}` gets the platform error description appended by
//! [`log_errno`] instead of the caller formatting it inline everywhere.

use log::{error, log, Level};

/// Format `template` and, unconditionally, append the description of
/// `errno` (or the current `errno` if `None`) in the form the original
/// diagnostic records used: `<message>: <strerror> (errno N)`.
pub fn log_errno(level: Level, template: &str, errno: Option<i32>) {
    let errno = errno.unwrap_or_else(|| {
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0)
    });
    let desc = std::io::Error::from_raw_os_error(errno);
    log!(level, "{template}: {desc} (errno {errno})");
}

/// Install the process-wide fatal handler (C9).
///
/// Two layers, matching the "last-resort reporter for unrecoverable
/// faults" requirement:
///
/// - a `std::panic` hook, for ordinary Rust panics, which logs and exits
///   with [`EXIT_FATAL`]
/// - a signal handler for `SIGSEGV`/`SIGBUS`/`SIGILL`/`SIGABRT`, for
///   faults that unwinding cannot reach, which formats the signal number
///   and faulting address from `siginfo_t` and terminates immediately
///   with [`EXIT_FATAL`] using only async-signal-safe calls
///
/// Grounded on the panic-hook-that-reboots-then-exits pattern used by the
/// corpus's init binary, generalized to a POSIX signal handler for the
/// fault case.
pub const EXIT_FATAL: i32 = 3;

pub fn install() {
    std::panic::set_hook(Box::new(|info| {
        error!("fatal: unhandled panic: {info}");
        std::process::exit(EXIT_FATAL);
    }));

    unsafe {
        install_fault_handler();
    }
}

unsafe fn install_fault_handler() {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = fault_handler as usize;
    action.sa_flags = libc::SA_SIGINFO;
    libc::sigemptyset(&mut action.sa_mask);

    for sig in [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGABRT] {
        libc::sigaction(sig, &action, std::ptr::null_mut());
    }
}

/// Async-signal-safe fault reporter: writes directly to fd 2 with
/// `libc::write`, never allocates, never calls back into `log`.
extern "C" fn fault_handler(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = unsafe {
        if info.is_null() {
            std::ptr::null()
        } else {
            (*info).si_addr()
        }
    };
    // format without allocating: a fixed small buffer and manual digit writes
    let mut buf = [0u8; 64];
    let msg = b"fatal: signal ";
    let mut pos = 0usize;
    for &b in msg {
        buf[pos] = b;
        pos += 1;
    }
    pos += write_u64(&mut buf[pos..], sig as u64);
    let at = b" at ";
    for &b in at {
        buf[pos] = b;
        pos += 1;
    }
    pos += write_hex(&mut buf[pos..], addr as u64);
    buf[pos] = b'\n';
    pos += 1;
    unsafe {
        libc::write(2, buf.as_ptr() as *const libc::c_void, pos);
        libc::_exit(EXIT_FATAL);
    }
}

fn write_u64(out: &mut [u8], mut v: u64) -> usize {
    if v == 0 {
        out[0] = b'0';
        return 1;
    }
    let mut tmp = [0u8; 20];
    let mut n = 0;
    while v > 0 {
        tmp[n] = b'0' + (v % 10) as u8;
        v /= 10;
        n += 1;
    }
    for i in 0..n {
        out[i] = tmp[n - 1 - i];
    }
    n
}

fn write_hex(out: &mut [u8], v: u64) -> usize {
    out[0] = b'0';
    out[1] = b'x';
    let digits = b"0123456789abcdef";
    let mut started = false;
    let mut n = 2;
    for shift in (0..16).rev() {
        let nibble = ((v >> (shift * 4)) & 0xf) as usize;
        if nibble != 0 {
            started = true;
        }
        if started || shift == 0 {
            out[n] = digits[nibble];
            n += 1;
        }
    }
    n
}
