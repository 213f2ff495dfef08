//! Shared-memory transport (Linux): a `memfd_create`-backed mapping
//! sized `header + buffer_size`, paired with three named POSIX
//! semaphores playing the role of the server mutex, the request event
//! and the response event (spec.md §4.5 "Shared-memory transport").
//!
//! `memfd_create` stands in for the platform's named-shared-memory
//! primitive: it is the portable POSIX mechanism for an anonymous,
//! `ftruncate`-able, `mmap`-able region, the same role `rustix::fs`/
//! `rustix::mm` play for the mapped dump in `peerofs::dump`.

use std::ffi::CString;
use std::ptr::NonNull;

use rustix::fs::{ftruncate, MemfdFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use super::Transport;
use crate::error::{ProxyError, Result};

const HEADER_BYTES: usize = 16;

struct NamedSem(*mut libc::sem_t);

impl NamedSem {
    /// Unlinks any stale semaphore under `name` and creates a fresh one.
    /// Correct for the request/response event semaphores, which are
    /// meant to be reset on every server start — but never for the
    /// server-mutex guard, since unlinking it would erase the evidence
    /// that another instance is already running.
    fn create_fresh(name: &str, initial: u32) -> Result<Self> {
        let cname = CString::new(name).unwrap();
        unsafe { libc::sem_unlink(cname.as_ptr()) };
        Self::open(&cname, libc::O_CREAT | libc::O_EXCL, initial, name)
    }

    /// Attaches to `name` if it already exists, or creates it with
    /// `initial` otherwise. Used for the server-mutex guard: leaving an
    /// existing semaphore alone is what lets `sem_trywait` in
    /// `ShmTransport::open` observe that a prior instance still holds it.
    fn attach_or_create(name: &str, initial: u32) -> Result<Self> {
        let cname = CString::new(name).unwrap();
        Self::open(&cname, libc::O_CREAT, initial, name)
    }

    fn open(cname: &CString, oflag: libc::c_int, initial: u32, name: &str) -> Result<Self> {
        let sem = unsafe { libc::sem_open(cname.as_ptr(), oflag, 0o600u32, initial) };
        if sem == libc::SEM_FAILED {
            return Err(ProxyError::AllocFailure(format!(
                "sem_open({name}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(NamedSem(sem as *mut libc::sem_t))
    }

    fn wait(&self) -> Result<()> {
        if unsafe { libc::sem_wait(self.0) } != 0 {
            return Err(ProxyError::BackingIo(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.0) } != 0 {
            return Err(ProxyError::BackingIo(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for NamedSem {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.0) };
    }
}

/// Guards a single `mmap`ped region, unmapping it on drop regardless of
/// which exit path is taken (DESIGN NOTES "Scoped acquisition").
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn new(fd: rustix::fd::BorrowedFd, len: usize) -> Result<Self> {
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| ProxyError::AllocFailure(format!("mmap failed: {e}")))?;
        Ok(Mapping {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null on success"),
            len,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { munmap(self.ptr.as_ptr().cast(), self.len).ok() };
    }
}

pub struct ShmTransport {
    memfd: rustix::fd::OwnedFd,
    mapping: Mapping,
    buffer_size: usize,
    server_mutex: NamedSem,
    request_event: NamedSem,
    response_event: NamedSem,
    read_cursor: usize,
    write_cursor: usize,
}

impl ShmTransport {
    /// `name` is the device identifier following `shm:`; the namespace
    /// prefix (global namespace when available) is left to the caller
    /// since Linux has no such concept — an empty prefix is used.
    pub fn open(name: &str, buffer_size: usize) -> Result<Self> {
        // Attach to the existing server-mutex semaphore if a prior
        // instance is still running, rather than unlinking and
        // recreating it — only then does a held-down `sem_trywait`
        // below actually mean something.
        let server_mutex = NamedSem::attach_or_create(&format!("/{name}_Server"), 1)?;
        if unsafe { libc::sem_trywait(server_mutex.0) } != 0 {
            return Err(ProxyError::AllocFailure(format!(
                "{name} already has a server attached"
            )));
        }

        let request_event = NamedSem::create_fresh(&format!("/{name}_Request"), 0)?;
        let response_event = NamedSem::create_fresh(&format!("/{name}_Response"), 0)?;

        let cname = CString::new(name).unwrap();
        let memfd = rustix::fs::memfd_create(&cname, MemfdFlags::CLOEXEC)
            .map_err(|e| ProxyError::AllocFailure(format!("memfd_create failed: {e}")))?;
        let total = HEADER_BYTES + buffer_size;
        ftruncate(&memfd, total as u64)
            .map_err(|e| ProxyError::AllocFailure(format!("ftruncate failed: {e}")))?;
        let mapping = Mapping::new(memfd.as_fd(), total)?;

        Ok(ShmTransport {
            memfd,
            mapping,
            buffer_size,
            server_mutex,
            request_event,
            response_event,
            read_cursor: HEADER_BYTES,
            write_cursor: HEADER_BYTES,
        })
    }

    fn payload(&self) -> &[u8] {
        &self.mapping.as_slice()[HEADER_BYTES..]
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.mapping.as_mut_slice()[HEADER_BYTES..]
    }
}

use rustix::fd::AsFd;

impl Transport for ShmTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<bool> {
        let start = self.read_cursor - HEADER_BYTES;
        let end = start + buf.len();
        if end > self.buffer_size {
            return Err(ProxyError::ShortIo);
        }
        buf.copy_from_slice(&self.payload()[start..end]);
        self.read_cursor += buf.len();
        Ok(true)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let start = self.write_cursor - HEADER_BYTES;
        let end = start + buf.len();
        if end > self.buffer_size {
            return Err(ProxyError::ShortIo);
        }
        self.payload_mut()[start..end].copy_from_slice(buf);
        self.write_cursor += buf.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.read_cursor = HEADER_BYTES;
        self.write_cursor = HEADER_BYTES;
        self.response_event.post()?;
        self.request_event.wait()
    }

    fn grow(&mut self, new_size: usize) -> Result<()> {
        if new_size <= self.buffer_size {
            return Ok(());
        }
        let total = HEADER_BYTES + new_size;
        ftruncate(&self.memfd, total as u64)
            .map_err(|e| ProxyError::AllocFailure(format!("ftruncate failed: {e}")))?;
        self.mapping = Mapping::new(self.memfd.as_fd(), total)?;
        self.buffer_size = new_size;
        Ok(())
    }
}

impl Drop for ShmTransport {
    fn drop(&mut self) {
        let _ = self.server_mutex.post();
    }
}
