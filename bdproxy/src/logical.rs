//! C4 — Logical I/O: a thin dispatcher to the VHD translator or directly
//! to the backing provider, always applying the image base offset first
//! (spec.md §4.4).

use crate::backing::{pread_full, pwrite_full, Backing};
use crate::error::Result;
use crate::vhd::Vhd;

pub const READ_ONLY: u64 = 1 << 0;

/// Geometry of the exposed logical image (spec.md §3 `ImageGeometry`).
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub physical_size: u64,
    pub current_size: u64,
    pub image_offset: u64,
    pub file_size: u64,
    pub req_alignment: u64,
    pub flags: u64,
}

impl Geometry {
    pub fn is_read_only(&self) -> bool {
        self.flags & READ_ONLY != 0
    }
}

pub struct LogicalIo {
    pub geometry: Geometry,
    pub vhd: Option<Vhd>,
}

impl LogicalIo {
    pub fn read(&self, backing: &Backing, out: &mut [u8], offset: u64) -> Result<usize> {
        // image_offset + req.offset is applied before handing off to
        // either the translator or the backing store, per spec.
        let abs_offset = self.geometry.image_offset + offset;
        match &self.vhd {
            Some(vhd) => vhd.read(backing, out, abs_offset),
            None => pread_full(backing, out, abs_offset),
        }
    }

    pub fn write(&mut self, backing: &Backing, data: &[u8], offset: u64) -> Result<usize> {
        let abs_offset = self.geometry.image_offset + offset;
        match &mut self.vhd {
            Some(vhd) => vhd.write(backing, data, abs_offset),
            None => pwrite_full(backing, data, abs_offset),
        }
    }
}
