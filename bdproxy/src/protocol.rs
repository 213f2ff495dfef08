//! C6 — Protocol Engine. Wire messages are little-endian packed structs
//! (spec.md §4.6), decoded the way the corpus decodes on-wire/on-disk
//! structs (`peerofs::disk` pattern), just little-endian instead of
//! big-endian since this is the proxy wire format rather than an
//! on-disk format.

use log::{debug, warn};
use zerocopy::byteorder::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::backing::Backing;
use crate::error::{ProxyError, Result};
use crate::logical::LogicalIo;
use crate::transport::Transport;

pub const CODE_INFO: u64 = 0x8474_4959_0000_0001;
pub const CODE_READ: u64 = 0x8474_4959_0000_0002;
pub const CODE_WRITE: u64 = 0x8474_4959_0000_0003;

const ENODEV: u64 = libc::ENODEV as u64;
const EBADF: u64 = libc::EBADF as u64;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct InfoResponse {
    pub file_size: U64,
    pub req_alignment: U64,
    pub flags: U64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RwRequestFields {
    pub offset: U64,
    pub length: U64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RwResponseHeader {
    pub errorno: U64,
    pub length: U64,
}

/// Owns the request-payload buffer (and, in VHD mode, nothing extra —
/// the VHD scratch buffer lives inside [`crate::vhd::Vhd`]) and grows it
/// on demand. Mirrors spec.md §3 `BufferPool`, minus the VHD scratch
/// field which this crate keeps colocated with the translator instead.
pub struct Buffers {
    pub primary: Vec<u8>,
}

impl Buffers {
    pub fn new(initial: usize) -> Self {
        Buffers {
            primary: vec![0u8; initial],
        }
    }

    pub fn ensure(&mut self, size: usize, transport: &mut dyn Transport) -> Result<()> {
        if size > self.primary.len() {
            transport.grow(size)?;
            self.primary.resize(size, 0);
        }
        Ok(())
    }
}

/// The request loop (spec.md §4.6). One request in flight at a time: the
/// next request is never read until the previous response has been
/// flushed (spec.md §5 ordering).
pub struct Engine<'a> {
    pub transport: &'a mut dyn Transport,
    pub backing: &'a Backing,
    pub io: &'a mut LogicalIo,
    pub buffers: &'a mut Buffers,
}

/// Outcome of one iteration of the loop, so the bootstrap's `main` can
/// decide whether to keep going.
pub enum Step {
    Continue,
    Eof,
}

impl<'a> Engine<'a> {
    pub fn run_one(&mut self) -> Result<Step> {
        let mut code_buf = [0u8; 8];
        match self.transport.read(&mut code_buf) {
            Ok(true) => {}
            Ok(false) => return Ok(Step::Eof),
            Err(e) => return Err(e),
        }
        let code = u64::from_le_bytes(code_buf);

        match code {
            CODE_INFO => self.handle_info()?,
            CODE_READ => self.handle_read()?,
            CODE_WRITE => self.handle_write()?,
            other => {
                warn!("unknown request code {other:#x}, replying ENODEV");
                self.transport.write(&ENODEV.to_le_bytes())?;
                self.transport.flush()?;
            }
        }
        Ok(Step::Continue)
    }

    fn handle_info(&mut self) -> Result<()> {
        let geo = self.io.geometry;
        let resp = InfoResponse {
            file_size: geo.file_size.into(),
            req_alignment: geo.req_alignment.into(),
            flags: geo.flags.into(),
        };
        self.transport.write(resp.as_bytes())?;
        self.transport.flush()?;
        debug!("INFO -> file_size={} align={} flags={}", geo.file_size, geo.req_alignment, geo.flags);
        Ok(())
    }

    fn handle_read(&mut self) -> Result<()> {
        let fields = self.read_rw_fields()?;
        let want = fields.length.get() as usize;

        self.buffers.ensure(want, self.transport)?;
        let buf = &mut self.buffers.primary[..want];
        buf.fill(0);

        match self.io.read(self.backing, buf, fields.offset.get()) {
            Ok(n) => {
                let header = RwResponseHeader {
                    errorno: 0u64.into(),
                    length: (n as u64).into(),
                };
                self.transport.write(header.as_bytes())?;
                self.transport.write(&buf[..n])?;
            }
            Err(e) => {
                let header = RwResponseHeader {
                    errorno: (e.errno() as u64).into(),
                    length: 0u64.into(),
                };
                self.transport.write(header.as_bytes())?;
            }
        }
        self.transport.flush()
    }

    fn handle_write(&mut self) -> Result<()> {
        let fields = self.read_rw_fields()?;
        let len = fields.length.get() as usize;

        self.buffers.ensure(len, self.transport)?;
        {
            let buf = &mut self.buffers.primary[..len];
            self.transport.read_exact(buf)?;
        }

        let header = if self.io.geometry.is_read_only() {
            RwResponseHeader {
                errorno: EBADF.into(),
                length: 0u64.into(),
            }
        } else {
            let buf = &self.buffers.primary[..len];
            match self.io.write(self.backing, buf, fields.offset.get()) {
                Ok(n) => RwResponseHeader {
                    errorno: 0u64.into(),
                    length: (n as u64).into(),
                },
                Err(e) => RwResponseHeader {
                    errorno: (e.errno() as u64).into(),
                    length: 0u64.into(),
                },
            }
        };
        self.transport.write(header.as_bytes())?;
        self.transport.flush()
    }

    fn read_rw_fields(&mut self) -> Result<RwRequestFields> {
        let mut raw = [0u8; std::mem::size_of::<RwRequestFields>()];
        self.transport.read_exact(&mut raw)?;
        RwRequestFields::read_from_bytes(&raw).map_err(|_| ProxyError::ShortIo)
    }
}
