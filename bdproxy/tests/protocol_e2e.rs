//! End-to-end scenarios from spec.md §8, driven through the real
//! `protocol::Engine` against an in-memory transport double instead of
//! a live socket — the engine only ever sees the `Transport` trait, so
//! this exercises the exact request/response framing a real client
//! would see.

use std::collections::VecDeque;
use std::io::Write;

use bdproxy::backing::Backing;
use bdproxy::error::Result;
use bdproxy::logical::{Geometry, LogicalIo, READ_ONLY};
use bdproxy::protocol::{Buffers, Engine, Step, CODE_INFO, CODE_READ, CODE_WRITE};
use bdproxy::transport::Transport;
use bdproxy::vhd::Vhd;

/// A transport double: requests are queued up front, responses are
/// captured into a flat byte vector for inspection after the run.
struct MemTransport {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

impl MemTransport {
    fn with_requests(bytes: Vec<u8>) -> Self {
        MemTransport {
            inbound: bytes.into(),
            outbound: Vec::new(),
        }
    }
}

impl Transport for MemTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<bool> {
        if self.inbound.is_empty() {
            return Ok(false);
        }
        for slot in buf.iter_mut() {
            *slot = self.inbound.pop_front().expect("short synthetic request");
        }
        Ok(true)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.outbound.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn grow(&mut self, _new_size: usize) -> Result<()> {
        Ok(())
    }
}

fn info_request() -> Vec<u8> {
    CODE_INFO.to_le_bytes().to_vec()
}

fn read_request(offset: u64, length: u64) -> Vec<u8> {
    let mut v = CODE_READ.to_le_bytes().to_vec();
    v.extend_from_slice(&offset.to_le_bytes());
    v.extend_from_slice(&length.to_le_bytes());
    v
}

fn write_request(offset: u64, payload: &[u8]) -> Vec<u8> {
    let mut v = CODE_WRITE.to_le_bytes().to_vec();
    v.extend_from_slice(&offset.to_le_bytes());
    v.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    v.extend_from_slice(payload);
    v
}

fn run_requests(
    backing: &Backing,
    io: &mut LogicalIo,
    requests: Vec<u8>,
) -> Vec<u8> {
    let mut transport = MemTransport::with_requests(requests);
    let mut buffers = Buffers::new(4096);
    loop {
        let mut engine = Engine {
            transport: &mut transport,
            backing,
            io,
            buffers: &mut buffers,
        };
        match engine.run_one().unwrap() {
            Step::Continue => continue,
            Step::Eof => break,
        }
    }
    transport.outbound
}

#[test]
fn info_on_raw_one_mebibyte_file() {
    let f = tempfile::NamedTempFile::new().unwrap();
    f.as_file().set_len(1024 * 1024).unwrap();
    let backing = Backing::open_file(f.path(), false).unwrap();
    let geometry = Geometry {
        physical_size: 1024 * 1024,
        current_size: 1024 * 1024,
        image_offset: 0,
        file_size: 1024 * 1024,
        req_alignment: 1,
        flags: 0,
    };
    let mut io = LogicalIo { geometry, vhd: None };

    let out = run_requests(&backing, &mut io, info_request());
    assert_eq!(out.len(), 24);
    assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), 1024 * 1024);
    assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 1);
    assert_eq!(u64::from_le_bytes(out[16..24].try_into().unwrap()), 0);
}

#[test]
fn read_write_read_on_raw_file() {
    let f = tempfile::NamedTempFile::new().unwrap();
    f.as_file().set_len(1024 * 1024).unwrap();
    let backing = Backing::open_file(f.path(), false).unwrap();
    let geometry = Geometry {
        physical_size: 1024 * 1024,
        current_size: 1024 * 1024,
        image_offset: 0,
        file_size: 1024 * 1024,
        req_alignment: 1,
        flags: 0,
    };
    let mut io = LogicalIo { geometry, vhd: None };

    let payload: Vec<u8> = b"ABCD".iter().cloned().cycle().take(512).collect();
    let mut requests = write_request(512, &payload);
    requests.extend(read_request(512, 512));
    requests.extend(read_request(0, 512));

    let out = run_requests(&backing, &mut io, requests);

    // WRITE response: errorno=0, length=512
    assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), 0);
    assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 512);

    // READ @512 response: errorno=0, length=512, then the payload
    let read1 = &out[16..];
    assert_eq!(u64::from_le_bytes(read1[0..8].try_into().unwrap()), 0);
    assert_eq!(u64::from_le_bytes(read1[8..16].try_into().unwrap()), 512);
    assert_eq!(&read1[16..16 + 512], payload.as_slice());

    // READ @0 response: all zero
    let read2 = &read1[16 + 512..];
    assert_eq!(u64::from_le_bytes(read2[0..8].try_into().unwrap()), 0);
    assert_eq!(u64::from_le_bytes(read2[8..16].try_into().unwrap()), 512);
    assert!(read2[16..16 + 512].iter().all(|&b| b == 0));
}

#[test]
fn read_only_write_is_rejected_without_touching_backing() {
    let f = tempfile::NamedTempFile::new().unwrap();
    f.as_file().set_len(4096).unwrap();
    let backing = Backing::open_file(f.path(), true).unwrap();
    let geometry = Geometry {
        physical_size: 4096,
        current_size: 4096,
        image_offset: 0,
        file_size: 4096,
        req_alignment: 1,
        flags: READ_ONLY,
    };
    let mut io = LogicalIo { geometry, vhd: None };

    let out = run_requests(&backing, &mut io, write_request(0, &[0xAB; 16]));
    assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), libc::EBADF as u64);
    assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 0);
}

#[test]
fn unknown_request_code_then_info_still_works() {
    let f = tempfile::NamedTempFile::new().unwrap();
    f.as_file().set_len(4096).unwrap();
    let backing = Backing::open_file(f.path(), false).unwrap();
    let geometry = Geometry {
        physical_size: 4096,
        current_size: 4096,
        image_offset: 0,
        file_size: 4096,
        req_alignment: 1,
        flags: 0,
    };
    let mut io = LogicalIo { geometry, vhd: None };

    let mut requests = 0xDEADBEEFDEADBEEFu64.to_le_bytes().to_vec();
    requests.extend(info_request());

    let out = run_requests(&backing, &mut io, requests);
    assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), libc::ENODEV as u64);
    assert_eq!(out.len(), 8 + 24);
}

#[test]
fn partition_selection_reads_the_right_sector() {
    // Two primaries: 100 MiB @ 1 MiB, 200 MiB @ 101 MiB.
    let mut sector = [0u8; 512];
    let write_entry = |sector: &mut [u8], idx: usize, status: u8, ptype: u8, start: u32, count: u32| {
        let off = 0x1BE + idx * 16;
        sector[off] = status;
        sector[off + 4] = ptype;
        sector[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
        sector[off + 12..off + 16].copy_from_slice(&count.to_le_bytes());
    };
    write_entry(&mut sector, 0, 0x80, 0x83, 2048, 204800);
    write_entry(&mut sector, 1, 0x00, 0x83, 206848, 409600);
    sector[510] = 0x55;
    sector[511] = 0xAA;

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&sector).unwrap();
    let marker_offset = 206848u64 * 512;
    let mut marker = vec![0u8; 512];
    marker[0] = 0x42;
    f.as_file().set_len(700_000 * 512).unwrap();
    {
        use std::os::unix::fs::FileExt;
        f.as_file().write_at(&marker, marker_offset).unwrap();
    }

    let backing = Backing::open_file(f.path(), true).unwrap();
    let (image_offset, file_size) = bdproxy::partition::resolve(&backing, 2).unwrap().unwrap();
    assert_eq!(image_offset, marker_offset);
    assert_eq!(file_size, 409600 * 512);

    let geometry = Geometry {
        physical_size: 700_000 * 512,
        current_size: 700_000 * 512,
        image_offset,
        file_size,
        req_alignment: 1,
        flags: 0,
    };
    let mut io = LogicalIo { geometry, vhd: None };

    let out = run_requests(&backing, &mut io, read_request(0, 512));
    assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), 0);
    assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 512);
    assert_eq!(out[16], 0x42);
}

#[test]
fn vhd_backed_session_reports_virtual_size_and_round_trips() {
    let block_size = 2 * 1024 * 1024u32;
    let virtual_size = 10 * 1024 * 1024u64;

    let mut header = vec![0u8; 1024];
    header[0..8].copy_from_slice(b"cxsparse");
    header[16..24].copy_from_slice(&1024u64.to_be_bytes());
    header[28..32].copy_from_slice(&block_size.to_be_bytes());

    let mut footer = vec![0u8; 512];
    footer[0..8].copy_from_slice(b"conectix");
    footer[40..48].copy_from_slice(&virtual_size.to_be_bytes());
    footer[64..68].copy_from_slice(&3u32.to_be_bytes());

    let max_entries = virtual_size.div_ceil(block_size as u64);
    let bat_bytes = max_entries * 4;
    let bat_area = bat_bytes.div_ceil(512) * 512;
    let bat = vec![0xFFu8; bat_area as usize];

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&header).unwrap();
    f.write_all(&bat).unwrap();
    f.write_all(&footer).unwrap();

    let backing = Backing::open_file(f.path(), false).unwrap();
    let vhd = Vhd::detect(&backing).unwrap().unwrap();
    assert_eq!(vhd.current_size, virtual_size);

    let geometry = Geometry {
        physical_size: f.as_file().metadata().unwrap().len(),
        current_size: virtual_size,
        image_offset: 0,
        file_size: virtual_size,
        req_alignment: 1,
        flags: 0,
    };
    let mut io = LogicalIo {
        geometry,
        vhd: Some(vhd),
    };

    let payload = [0xCDu8; 32];
    let mut requests = write_request(block_size as u64, &payload);
    requests.extend(read_request(block_size as u64, 32));

    let out = run_requests(&backing, &mut io, requests);
    assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), 0);
    assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 32);
    let read_resp = &out[16..];
    assert_eq!(u64::from_le_bytes(read_resp[0..8].try_into().unwrap()), 0);
    assert_eq!(u64::from_le_bytes(read_resp[8..16].try_into().unwrap()), 32);
    assert_eq!(&read_resp[16..16 + 32], payload.as_slice());
}
