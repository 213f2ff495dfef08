//! C2 — Partition Resolver. MBR + EBR chain walk, grounded on the
//! corpus's `MbrPartitionTableEntry` decoding style (little-endian
//! fixed-layout struct read field by field) but restructured as a pure
//! walk returning `(offset, length)` instead of a table for display.

use crate::backing::{pread_full, Backing};
use crate::error::{ProxyError, Result};

const SECTOR_SIZE: u64 = 512;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const ENTRY_SIZE: usize = 16;
const NUM_ENTRIES: usize = 4;

const TYPE_EMPTY: u8 = 0x00;
const TYPE_EXTENDED_CHS: u8 = 0x05;
const TYPE_EXTENDED_LBA: u8 = 0x0F;

struct Entry {
    status: u8,
    partition_type: u8,
    rel_start: u32,
    num_sectors: u32,
}

impl Entry {
    fn parse(raw: &[u8]) -> Entry {
        Entry {
            status: raw[0],
            partition_type: raw[4],
            rel_start: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            num_sectors: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
        }
    }

    fn is_extended(&self) -> bool {
        self.partition_type == TYPE_EXTENDED_CHS || self.partition_type == TYPE_EXTENDED_LBA
    }
}

/// Reads one 512-byte sector (an MBR or EBR) at `offset` and validates
/// the boot signature plus the "all status bytes have bit 7 clear or are
/// exactly 0x80" rule (spec.md §4.2 step 1).
fn read_table_sector(backing: &Backing, offset: u64) -> Result<Option<[Entry; NUM_ENTRIES]>> {
    let mut sector = [0u8; SECTOR_SIZE as usize];
    let n = pread_full(backing, &mut sector, offset)?;
    if n < SECTOR_SIZE as usize {
        return Ok(None);
    }
    if sector[510..512] != MBR_SIGNATURE {
        return Ok(None);
    }
    let entries: [Entry; NUM_ENTRIES] = std::array::from_fn(|i| {
        Entry::parse(&sector[PARTITION_TABLE_OFFSET + i * ENTRY_SIZE..][..ENTRY_SIZE])
    });
    for e in &entries {
        if e.status & 0x7F != 0 {
            return Ok(None);
        }
    }
    Ok(Some(entries))
}

/// Resolve partition index `n` (1-based) to `(image_offset, file_size)`.
/// Returns `Ok(None)` when there is no valid MBR at all, meaning the
/// image covers the entire backing store (spec.md §4.2 output).
pub fn resolve(backing: &Backing, n: u32) -> Result<Option<(u64, u64)>> {
    if !(1..=511).contains(&n) {
        return Err(ProxyError::BadFormat(format!("partition index {n} out of range")));
    }

    let Some(mbr) = read_table_sector(backing, 0)? else {
        return Ok(None);
    };

    let mut counter = 0u32;
    for entry in &mbr {
        if entry.partition_type == TYPE_EMPTY {
            continue;
        }
        if entry.is_extended() {
            let first_ebr = entry.rel_start as u64 * SECTOR_SIZE;
            if let Some((off, len)) = walk_ebr_chain(backing, first_ebr, n, &mut counter)? {
                return Ok(Some(validate_bounds(backing, off, len)?));
            }
            continue;
        }
        counter += 1;
        if counter == n {
            let off = entry.rel_start as u64 * SECTOR_SIZE;
            let len = entry.num_sectors as u64 * SECTOR_SIZE;
            return Ok(Some(validate_bounds(backing, off, len)?));
        }
    }

    Err(ProxyError::BadFormat(format!("partition {n} not found")))
}

fn walk_ebr_chain(
    backing: &Backing,
    first_ebr: u64,
    n: u32,
    counter: &mut u32,
) -> Result<Option<(u64, u64)>> {
    let mut ebr_offset = first_ebr;
    loop {
        let Some(entries) = read_table_sector(backing, ebr_offset)? else {
            return Ok(None);
        };

        let mut next_ebr_rel: Option<u32> = None;
        let mut logical: Option<(u64, u64)> = None;
        for entry in &entries {
            if entry.partition_type == TYPE_EMPTY {
                continue;
            }
            if entry.is_extended() {
                next_ebr_rel = Some(entry.rel_start);
            } else if logical.is_none() {
                let off = ebr_offset + entry.rel_start as u64 * SECTOR_SIZE;
                let len = entry.num_sectors as u64 * SECTOR_SIZE;
                logical = Some((off, len));
            }
        }

        if let Some((off, len)) = logical {
            *counter += 1;
            if *counter == n {
                return Ok(Some((off, len)));
            }
        }

        match next_ebr_rel {
            Some(rel) => ebr_offset = first_ebr + rel as u64 * SECTOR_SIZE,
            None => return Ok(None),
        }
    }
}

fn validate_bounds(backing: &Backing, offset: u64, len: u64) -> Result<(u64, u64)> {
    if len == 0 {
        return Err(ProxyError::BadFormat("zero-length partition".into()));
    }
    if let Some(physical) = backing.physical_size()? {
        let in_bounds = offset
            .checked_add(len)
            .map(|end| end <= physical)
            .unwrap_or(false);
        if !in_bounds {
            return Err(ProxyError::BadFormat(
                "partition extends past end of backing store".into(),
            ));
        }
    }
    Ok((offset, len))
}
