//! Kernel-driver transport (Linux, `--features kdrv`): an ioctl exchange
//! against a well-known device path, including the buffer-grow dance
//! (spec.md §4.5 "Kernel-driver transport"). The real kernel-mode
//! counterpart is out of scope (spec.md §1); this module only talks to
//! the documented ioctl *contract*, exercised in tests against a fake
//! responder rather than a real device.

use std::os::fd::{AsFd, BorrowedFd};

use super::Transport;
use crate::error::{ProxyError, Result};

/// Anything that can stand in for the device fd, so tests can exercise
/// the grow state machine against a fake responder instead of a real
/// kernel driver.
pub trait IoctlDevice {
    fn lock_memory(&self, fd: BorrowedFd<'_>, len: usize) -> Result<()>;
    /// Returns `Ok(true)` on a normal completion, `Ok(false)` on a
    /// graceful `ENODEV` disconnect, and `Err(insufficient_buffer)`-style
    /// errors via [`ProxyError`].
    fn exchange_io(&self, fd: BorrowedFd<'_>) -> Result<bool>;
}

/// Production device handle. The real ioctl numbers belong to the
/// (out-of-scope, spec.md §1) kernel driver's published contract; this
/// crate documents the shape of the exchange but has no concrete device
/// to issue ioctls against, so every call reports the contract as
/// unavailable rather than guessing request codes.
pub struct RealDevice;

impl IoctlDevice for RealDevice {
    fn lock_memory(&self, _fd: BorrowedFd<'_>, _len: usize) -> Result<()> {
        Err(ProxyError::AllocFailure(
            "kernel-driver transport requires a concrete ioctl contract".into(),
        ))
    }

    fn exchange_io(&self, _fd: BorrowedFd<'_>) -> Result<bool> {
        Err(ProxyError::AllocFailure(
            "kernel-driver transport requires a concrete ioctl contract".into(),
        ))
    }
}

pub struct KdrvTransport<D: IoctlDevice = RealDevice> {
    device_fd: std::fs::File,
    ioctl: D,
    buf: Vec<u8>,
    read_cursor: usize,
    write_cursor: usize,
}

impl KdrvTransport<RealDevice> {
    pub fn open(path: &std::path::Path, buffer_size: usize) -> Result<Self> {
        let device_fd = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mut t = KdrvTransport {
            device_fd,
            ioctl: RealDevice,
            buf: vec![0u8; buffer_size],
            read_cursor: 0,
            write_cursor: 0,
        };
        t.lock()?;
        Ok(t)
    }
}

impl<D: IoctlDevice> KdrvTransport<D> {
    fn lock(&mut self) -> Result<()> {
        self.ioctl
            .lock_memory(self.device_fd.as_fd(), self.buf.len())
    }
}

impl<D: IoctlDevice> Transport for KdrvTransport<D> {
    fn read(&mut self, buf: &mut [u8]) -> Result<bool> {
        let end = self.read_cursor + buf.len();
        if end > self.buf.len() {
            return Err(ProxyError::ShortIo);
        }
        buf.copy_from_slice(&self.buf[self.read_cursor..end]);
        self.read_cursor += buf.len();
        Ok(true)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.write_cursor + buf.len();
        if end > self.buf.len() {
            return Err(ProxyError::ShortIo);
        }
        self.buf[self.write_cursor..end].copy_from_slice(buf);
        self.write_cursor += buf.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.read_cursor = 0;
        self.write_cursor = 0;
        match self.ioctl.exchange_io(self.device_fd.as_fd()) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProxyError::TransportClosed),
            Err(e) => Err(e),
        }
    }

    fn grow(&mut self, new_size: usize) -> Result<()> {
        if new_size <= self.buf.len() {
            return Ok(());
        }
        // Drain the outstanding lock, then double until large enough —
        // doubling (not jumping straight to new_size) matches the
        // documented buffer-grow protocol.
        let mut size = self.buf.len().max(1);
        while size < new_size {
            size *= 2;
        }
        self.buf.resize(size, 0);
        self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::fd::AsFd;

    /// Fakes the grow negotiation: `exchange_io` fails with
    /// `INSUFFICIENT_BUFFER` until the buffer has grown past `needed`.
    struct FakeResponder {
        needed: usize,
        locked_len: RefCell<usize>,
    }

    impl IoctlDevice for FakeResponder {
        fn lock_memory(&self, _fd: BorrowedFd<'_>, len: usize) -> Result<()> {
            *self.locked_len.borrow_mut() = len;
            Ok(())
        }

        fn exchange_io(&self, _fd: BorrowedFd<'_>) -> Result<bool> {
            if *self.locked_len.borrow() < self.needed {
                return Err(ProxyError::AllocFailure("INSUFFICIENT_BUFFER".into()));
            }
            Ok(true)
        }
    }

    fn fixture(needed: usize, initial: usize) -> KdrvTransport<FakeResponder> {
        let device_fd = tempfile::tempfile().unwrap();
        KdrvTransport {
            device_fd,
            ioctl: FakeResponder {
                needed,
                locked_len: RefCell::new(initial),
            },
            buf: vec![0u8; initial],
            read_cursor: 0,
            write_cursor: 0,
        }
    }

    #[test]
    fn grow_doubles_until_large_enough() {
        let mut t = fixture(10_000, 1024);
        t.grow(10_000).unwrap();
        assert!(t.buf.len() >= 10_000);
        assert_eq!(t.buf.len(), 1024 * 16);
    }

    #[test]
    fn flush_succeeds_once_buffer_is_large_enough() {
        let mut t = fixture(2048, 1024);
        t.grow(2048).unwrap();
        // grow() re-locks with the new length via the fake responder.
        t.flush().unwrap();
    }

    #[test]
    fn small_grow_requests_are_a_no_op() {
        let mut t = fixture(10_000, 4096);
        t.grow(100).unwrap();
        assert_eq!(t.buf.len(), 4096);
    }
}
