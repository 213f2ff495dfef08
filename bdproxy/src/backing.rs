//! C1 — Backing Provider.
//!
//! Exposes positional read/write/close over either an open file or a
//! dynamically-loaded plugin session. Read-only mode is advisory here
//! and enforced at the protocol engine (C6); see spec.md §4.1.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use crate::error::{ProxyError, Result};
use crate::plugin::PluginSession;

pub enum Backing {
    File(File),
    Plugin(PluginSession),
}

impl Backing {
    /// Open `path` as a plain file. Attempts `O_DIRECT`/`O_DSYNC` first
    /// and falls back to ordinary buffered I/O when the kernel rejects
    /// them — some filesystems and most container overlays treat these
    /// flags as unsupported rather than silent no-ops, so the fallback
    /// is load-bearing, not defensive decoration.
    pub fn open_file(path: &Path, read_only: bool) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(!read_only);
        opts.custom_flags(libc::O_DIRECT);
        let file = opts.open(path).or_else(|_| {
            let mut opts = OpenOptions::new();
            opts.read(true).write(!read_only);
            opts.open(path)
        })?;
        Ok(Backing::File(file))
    }

    pub fn open_plugin(spec: &str, read_only: bool) -> Result<Self> {
        PluginSession::open(spec, read_only).map(Backing::Plugin)
    }

    /// Physical size of the backing store, when it can be determined
    /// without external help (file length, or a plugin-reported size).
    pub fn physical_size(&self) -> Result<Option<u64>> {
        match self {
            Backing::File(f) => Ok(Some(f.metadata()?.len())),
            Backing::Plugin(p) => Ok(p.reported_size()),
        }
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            Backing::File(f) => Ok(f.read_at(buf, offset)?),
            Backing::Plugin(p) => p.read(buf, offset),
        }
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        match self {
            Backing::File(f) => Ok(f.write_at(buf, offset)?),
            Backing::Plugin(p) => p.write(buf, offset),
        }
    }

    pub fn raw_fd(&self) -> Option<i32> {
        match self {
            Backing::File(f) => Some(f.as_raw_fd()),
            Backing::Plugin(_) => None,
        }
    }
}

/// Full positional read, retrying short reads the way the socket
/// transport retries short frames (spec.md: "implementers should ...
/// tolerate" short I/O by looping, not by failing outright).
pub fn pread_full(backing: &Backing, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = backing.pread(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

pub fn pwrite_full(backing: &Backing, buf: &[u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = backing.pwrite(&buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(ProxyError::ShortIo);
        }
        done += n;
    }
    Ok(done)
}
