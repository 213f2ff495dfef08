//! C3 — VHD Translator.
//!
//! Decodes and maintains a Microsoft dynamic-VHD sparse image: a 512-byte
//! footer mirrored at end-of-file, a 1024-byte header holding the block
//! allocation table location, and per-block sector bitmaps. All on-disk
//! multi-byte fields are big-endian (spec.md §3 `VhdContext`), decoded
//! with `zerocopy`'s byte-order-aware types the way the corpus decodes
//! on-disk structs (`peerofs::disk::Superblock`), just in the big-endian
//! flavor VHD actually uses.

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::backing::{pread_full, pwrite_full, Backing};
use crate::error::{ProxyError, Result};

pub const FOOTER_SIZE: u64 = 512;
pub const HEADER_SIZE: u64 = 1024;
pub const SECTOR_SIZE: u64 = 512;
const FOOTER_COOKIE: &[u8; 8] = b"conectix";
const HEADER_COOKIE: &[u8; 8] = b"cxsparse";
const DISK_TYPE_DYNAMIC: u32 = 3;
const BAT_UNALLOCATED: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Footer {
    pub cookie: [u8; 8],
    pub features: U32,
    pub file_format_version: U32,
    pub data_offset: U64,
    pub timestamp: U32,
    pub creator_application: [u8; 4],
    pub creator_version: U32,
    pub creator_host_os: U32,
    pub original_size: U64,
    pub current_size: U64,
    pub disk_geometry_cylinders: U16,
    pub disk_geometry_heads: u8,
    pub disk_geometry_sectors: u8,
    pub disk_type: U32,
    pub checksum: U32,
    pub unique_id: [u8; 16],
    pub saved_state: u8,
    pub reserved: [u8; 427],
}

const _: () = assert!(std::mem::size_of::<Footer>() == FOOTER_SIZE as usize);

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Header {
    pub cookie: [u8; 8],
    pub data_offset: U64,
    pub table_offset: U64,
    pub header_version: U32,
    pub max_table_entries: U32,
    pub block_size: U32,
    pub checksum: U32,
    pub parent_unique_id: [u8; 16],
    pub parent_timestamp: U32,
    pub reserved1: U32,
    pub parent_unicode_name: [u8; 512],
    pub parent_locator: [u8; 192],
    pub reserved2: [u8; 256],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE as usize);

/// Owned VHD translator state: footer, header, derived shifts and the
/// BAT location. No globals (DESIGN NOTES "VHD translator state") — every
/// read/write takes `&self`/`&mut self` explicitly.
pub struct Vhd {
    pub footer: Footer,
    pub header: Header,
    pub block_size: u32,
    pub block_shift: u32,
    pub sector_shift: u32,
    pub table_offset: u64,
    pub current_size: u64,
}

impl Vhd {
    /// Probe `backing` for a dynamic VHD footer/header pair and, if
    /// found, build a translator. Autodetect is on by default (spec.md
    /// §4.3): reads the first 1024 bytes and checks the header cookie,
    /// then the footer cookie and disk type.
    pub fn detect(backing: &Backing) -> Result<Option<Vhd>> {
        let mut first = [0u8; HEADER_SIZE as usize];
        let n = pread_full(backing, &mut first, 0)?;
        if n < HEADER_SIZE as usize {
            return Ok(None);
        }
        if &first[0..8] != HEADER_COOKIE {
            return Ok(None);
        }

        let physical = backing
            .physical_size()?
            .ok_or_else(|| ProxyError::BadFormat("cannot determine backing size for VHD probe".into()))?;
        if physical < FOOTER_SIZE {
            return Ok(None);
        }
        let mut footer_bytes = [0u8; FOOTER_SIZE as usize];
        pread_full(backing, &mut footer_bytes, physical - FOOTER_SIZE)?;
        if &footer_bytes[0..8] != FOOTER_COOKIE {
            return Ok(None);
        }
        let footer = Footer::read_from_bytes(&footer_bytes)
            .map_err(|_| ProxyError::BadFormat("short VHD footer".into()))?;
        if footer.disk_type.get() != DISK_TYPE_DYNAMIC {
            return Ok(None);
        }

        let header = Header::read_from_bytes(&first)
            .map_err(|_| ProxyError::BadFormat("short VHD header".into()))?;

        let block_size = header.block_size.get();
        let block_shift = validated_shift(block_size, SECTOR_SIZE as u32)?;

        Ok(Some(Vhd {
            block_size,
            block_shift,
            sector_shift: SECTOR_SIZE.trailing_zeros(),
            table_offset: header.table_offset.get(),
            current_size: footer.current_size.get(),
            footer,
            header,
        }))
    }

    fn bitmap_bytes(&self) -> u64 {
        let bits = self.block_size as u64 / SECTOR_SIZE;
        let bytes = bits.div_ceil(8);
        bytes.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
    }

    fn bat_entry_offset(&self, block_no: u64) -> u64 {
        self.table_offset + block_no * 4
    }

    fn read_bat_entry(&self, backing: &Backing, block_no: u64) -> Result<u32> {
        let mut raw = [0u8; 4];
        let n = pread_full(backing, &mut raw, self.bat_entry_offset(block_no))?;
        if n < 4 {
            return Err(ProxyError::ShortIo);
        }
        Ok(u32::from_be_bytes(raw))
    }

    fn write_bat_entry(&self, backing: &Backing, block_no: u64, sector: u32) -> Result<()> {
        pwrite_full(backing, &sector.to_be_bytes(), self.bat_entry_offset(block_no))?;
        Ok(())
    }

    /// Splits `[offset, offset+size)` into block-aligned chunks, calling
    /// `f(chunk_offset, chunk_len, block_no, in_block)` for each. This
    /// replaces the source's self-recursion (DESIGN NOTES item 3 / the
    /// "cyclic recursion" open question) with an iterative loop so a very
    /// large request cannot grow the call stack. A free function (not a
    /// method) so `write`'s closure is free to borrow `self` mutably —
    /// taking `&self` here as well would conflict with that.
    fn chunks(
        block_shift: u32,
        block_size: u32,
        offset: u64,
        size: u64,
        mut f: impl FnMut(u64, u64, u64, u64) -> Result<u64>,
    ) -> Result<u64> {
        let mut done = 0u64;
        while done < size {
            let cur_offset = offset + done;
            let block_no = cur_offset >> block_shift;
            let in_block = cur_offset & (block_size as u64 - 1);
            let chunk = std::cmp::min(size - done, block_size as u64 - in_block);
            let got = f(cur_offset, chunk, block_no, in_block)?;
            done += got;
            if got < chunk {
                break;
            }
        }
        Ok(done)
    }

    /// Read path (spec.md §4.3.1). The bitmap is never consulted; an
    /// unallocated block reads as zero, an allocated block is read
    /// directly (unallocated sectors inside an allocated block are
    /// expected to already be zero on disk). Exactly one `pread` per
    /// chunk — the source's double-read for the allocated case is a bug
    /// per the spec's open questions and is not replicated.
    pub fn read(&self, backing: &Backing, out: &mut [u8], offset: u64) -> Result<usize> {
        let size = out.len() as u64;
        if offset.checked_add(size).map(|e| e > self.current_size).unwrap_or(true) {
            return Ok(0);
        }
        Self::chunks(
            self.block_shift,
            self.block_size,
            offset,
            size,
            |chunk_offset, chunk, block_no, in_block| {
                let dst = &mut out[(chunk_offset - offset) as usize..][..chunk as usize];
                let entry = self.read_bat_entry(backing, block_no)?;
                if entry == BAT_UNALLOCATED {
                    dst.fill(0);
                    return Ok(chunk);
                }
                let data_offset =
                    ((entry as u64) << self.sector_shift) + self.bitmap_bytes() + in_block;
                let n = pread_full(backing, dst, data_offset)? as u64;
                Ok(n)
            },
        )
        .map(|n| n as usize)
    }

    /// Write path (spec.md §4.3.2). Allocating a new block places it at
    /// the byte offset currently occupied by the footer, writes a
    /// zeroed bitmap-sector-plus-block region followed by the in-memory
    /// footer (so the footer mirror is restored at the new EOF in the
    /// same write that reserves the block), then updates the BAT and
    /// sector bitmap.
    pub fn write(&mut self, backing: &Backing, data: &[u8], offset: u64) -> Result<usize> {
        let size = data.len() as u64;
        let mut scratch = vec![0u8; self.bitmap_bytes() as usize];
        let block_shift = self.block_shift;
        let block_size = self.block_size;
        Self::chunks(
            block_shift,
            block_size,
            offset,
            size,
            |chunk_offset, chunk, block_no, in_block| {
                let src = &data[(chunk_offset - offset) as usize..][..chunk as usize];
                let mut entry = self.read_bat_entry(backing, block_no)?;

                if entry == BAT_UNALLOCATED {
                    if is_all_zero(src) {
                        return Ok(chunk);
                    }
                    entry = self.allocate_block(backing)?;
                    self.write_bat_entry(backing, block_no, entry)?;
                }

                let data_offset =
                    ((entry as u64) << self.sector_shift) + self.bitmap_bytes() + in_block;
                pwrite_full(backing, src, data_offset)?;

                self.mark_bitmap(backing, &mut scratch, entry, in_block, chunk)?;
                Ok(chunk)
            },
        )
        .map(|n| n as usize)
    }

    /// Reserve a new block at the current end-of-file-minus-footer
    /// position and restore the footer mirror there (spec.md §4.3.2
    /// step 2). Returns the block's start sector.
    fn allocate_block(&mut self, backing: &Backing) -> Result<u32> {
        let physical = backing
            .physical_size()?
            .ok_or_else(|| ProxyError::BadFormat("cannot determine backing size".into()))?;
        if physical < FOOTER_SIZE {
            return Err(ProxyError::BadFormat("backing store smaller than a VHD footer".into()));
        }
        let new_block_start = physical - FOOTER_SIZE;
        if new_block_start % SECTOR_SIZE != 0 {
            return Err(ProxyError::BadFormat("VHD EOF not sector-aligned".into()));
        }
        let new_start_sector = new_block_start >> self.sector_shift;
        let new_start_sector: u32 = new_start_sector
            .try_into()
            .map_err(|_| ProxyError::AllocFailure("VHD grew past 32-bit sector addressing".into()))?;

        let reserve_len = self.bitmap_bytes() + self.block_size as u64;
        let mut composite = vec![0u8; (reserve_len + FOOTER_SIZE) as usize];
        composite[reserve_len as usize..].copy_from_slice(self.footer.as_bytes());
        pwrite_full(backing, &composite, new_block_start)?;

        Ok(new_start_sector)
    }

    /// Mark `chunk` bytes starting `in_block` bytes into the block
    /// (whose allocated sector is `block_sector`) as present in the
    /// sector bitmap. Coarse at byte (8-sector) granularity, as
    /// specified: a partial-sector write may over-mark neighbouring
    /// sectors sharing the same bitmap byte, which is harmless because
    /// those sectors physically exist in the allocated block.
    fn mark_bitmap(
        &self,
        backing: &Backing,
        scratch: &mut [u8],
        block_sector: u32,
        in_block: u64,
        chunk: u64,
    ) -> Result<()> {
        let first_sector_in_block = in_block >> self.sector_shift;
        let bitmap_offset =
            ((block_sector as u64) << self.sector_shift) + (first_sector_in_block >> 3);
        let sectors_touched = chunk.div_ceil(SECTOR_SIZE);
        let bitmap_bytes = sectors_touched.div_ceil(8) as usize;

        scratch[..bitmap_bytes].fill(0xFF);
        pwrite_full(backing, &scratch[..bitmap_bytes], bitmap_offset)?;
        Ok(())
    }
}

/// "Return false the moment any lane is nonzero, otherwise true" — the
/// intent of the source's syntactically suspicious zero-scan loop
/// (spec.md §9 open questions), implemented as a straightforward
/// test-and-bail over 8-byte lanes with a byte-wise tail.
fn is_all_zero(buf: &[u8]) -> bool {
    let chunks = buf.chunks_exact(8);
    let tail = chunks.remainder();
    for lane in chunks {
        let lane: [u8; 8] = lane.try_into().unwrap();
        if u64::from_ne_bytes(lane) != 0 {
            return false;
        }
    }
    tail.iter().all(|&b| b == 0)
}

fn validated_shift(value: u32, min: u32) -> Result<u32> {
    if value == 0 || !value.is_power_of_two() || value < min {
        return Err(ProxyError::BadFormat(format!(
            "block size {value} is not a power of two >= {min}"
        )));
    }
    Ok(value.trailing_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_dynamic_vhd(block_size: u32, virtual_size: u64) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(HEADER_COOKIE);
        header[16..24].copy_from_slice(&(HEADER_SIZE).to_be_bytes()); // table_offset
        header[28..32].copy_from_slice(&block_size.to_be_bytes());

        let mut footer = [0u8; FOOTER_SIZE as usize];
        footer[0..8].copy_from_slice(FOOTER_COOKIE);
        footer[40..48].copy_from_slice(&virtual_size.to_be_bytes()); // current_size
        footer[64..68].copy_from_slice(&DISK_TYPE_DYNAMIC.to_be_bytes()); // disk_type

        let max_entries = virtual_size.div_ceil(block_size as u64);
        let bat_bytes = max_entries * 4;
        // real dynamic VHDs pad the BAT out to a sector boundary before
        // any block data (or the footer, if nothing is allocated yet)
        let bat_area = (bat_bytes as u64).div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        let mut bat = vec![0xFFu8; bat_area as usize];
        bat[bat_bytes as usize..].fill(0);

        f.write_all(&header).unwrap();
        f.write_all(&bat).unwrap();
        f.write_all(&footer).unwrap();
        f
    }

    fn open(f: &tempfile::NamedTempFile) -> (Backing, Vhd) {
        let backing = Backing::open_file(f.path(), false).unwrap();
        let vhd = Vhd::detect(&backing).unwrap().unwrap();
        (backing, vhd)
    }

    #[test]
    fn fresh_image_reads_zero() {
        let f = make_dynamic_vhd(2 * 1024 * 1024, 10 * 1024 * 1024);
        let (backing, vhd) = open(&f);
        let mut buf = [1u8; 64];
        let n = vhd.read(&backing, &mut buf, 0).unwrap();
        assert_eq!(n, 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn sparse_growth_allocates_one_block() {
        let block_size = 2 * 1024 * 1024u32;
        let f = make_dynamic_vhd(block_size, 10 * 1024 * 1024);
        let pre_len = f.as_file().metadata().unwrap().len();
        let (backing, mut vhd) = open(&f);

        let payload = [0xABu8; 16];
        let n = vhd.write(&backing, &payload, block_size as u64).unwrap();
        assert_eq!(n, 16);

        let post_len = f.as_file().metadata().unwrap().len();
        assert_eq!(post_len, pre_len + SECTOR_SIZE + block_size as u64);

        let mut footer_bytes = [0u8; FOOTER_SIZE as usize];
        pread_full(&backing, &mut footer_bytes, post_len - FOOTER_SIZE).unwrap();
        assert_eq!(&footer_bytes, vhd.footer.as_bytes());

        let entry = vhd.read_bat_entry(&backing, 1).unwrap();
        assert_eq!(entry, ((pre_len - FOOTER_SIZE) / 512) as u32);

        let mut readback = [0u8; 16];
        vhd.read(&backing, &mut readback, block_size as u64).unwrap();
        assert_eq!(readback, payload);

        let mut zeros = [1u8; 16];
        vhd.read(&backing, &mut zeros, block_size as u64 + 16).unwrap();
        assert!(zeros.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_write_does_not_allocate() {
        let block_size = 2 * 1024 * 1024u32;
        let f = make_dynamic_vhd(block_size, 10 * 1024 * 1024);
        let pre_len = f.as_file().metadata().unwrap().len();
        let (backing, mut vhd) = open(&f);

        let payload = [0u8; 4096];
        vhd.write(&backing, &payload, (block_size as u64) * 2).unwrap();

        let post_len = f.as_file().metadata().unwrap().len();
        assert_eq!(post_len, pre_len);
        assert_eq!(vhd.read_bat_entry(&backing, 2).unwrap(), BAT_UNALLOCATED);
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        assert!(validated_shift(3, 512).is_err());
        assert!(validated_shift(0, 512).is_err());
        assert!(validated_shift(256, 512).is_err());
        assert!(validated_shift(1024, 512).is_ok());
    }

    #[test]
    fn zero_scan_bails_on_first_nonzero_lane() {
        let mut buf = vec![0u8; 4096];
        assert!(is_all_zero(&buf));
        buf[4095] = 1;
        assert!(!is_all_zero(&buf));
        buf[4095] = 0;
        buf[0] = 1;
        assert!(!is_all_zero(&buf));
    }
}
