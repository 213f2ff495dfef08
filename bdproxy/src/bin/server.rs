//! C7 — Bootstrap. Parses the CLI surface (spec.md §6), opens the
//! backing store, probes for VHD, resolves an optional partition,
//! builds the chosen transport, and enters the C6 request loop.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use bdproxy::backing::Backing;
use bdproxy::diag;
use bdproxy::logical::{Geometry, LogicalIo, READ_ONLY};
use bdproxy::partition;
use bdproxy::protocol::{Buffers, Engine, Step};
use bdproxy::size::parse_size;
use bdproxy::transport::socket::SocketTransport;
use bdproxy::transport::Transport;
use bdproxy::vhd::Vhd;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// User-space block-device proxy server.
#[derive(Parser, Debug)]
#[command(name = "bdproxy", version, about)]
struct Cli {
    /// Load an I/O provider from `lib;entry` instead of opening `image` as a file.
    #[arg(long = "dll", value_name = "lib;entry")]
    dll: Option<String>,

    /// Use the kernel-driver transport instead of interpreting `comm` as socket/shm.
    #[arg(long = "drv")]
    drv: bool,

    /// Disable VHD autodetection even if the image looks like a dynamic VHD.
    #[arg(long = "novhd")]
    novhd: bool,

    /// Expose the image read-only.
    #[arg(short = 'r')]
    read_only: bool,

    /// Comm endpoint: a decimal TCP port, `-` for stdio, `shm:<name>`, `drv:<name>`,
    /// or a local device path.
    comm: String,

    /// Backing image path (ignored when `--dll` is given; still used to name the
    /// plugin session if the plugin wants a path-shaped name).
    image: PathBuf,

    /// Logical size (with suffix) or a 1-based partition index. Bare digits with
    /// no suffix and small enough to plausibly be a partition index are treated as
    /// a partition number; anything with a size suffix is a size override.
    #[arg(value_name = "size|partno")]
    size_or_partno: Option<String>,

    /// Explicit image_offset (with suffix). Spec note: only consulted when the
    /// partition resolver did not already produce a nonzero offset.
    offset: Option<String>,

    /// Minimum client alignment (with suffix), default 1.
    align: Option<String>,

    /// Initial payload buffer size (with suffix), default 64K.
    bufsize: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    diag::install();

    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(code) => ExitCode::from(code as u8),
    }
}

/// Returns the process exit code either way; failures are logged before
/// returning so the caller only has to propagate the code (spec.md §6
/// exit codes: 0 clean shutdown, 1 open/read failure, 2 transport/setup
/// failure, 9 could not dismount a read-write volume, -1/255 usage error).
fn run() -> Result<i32, i32> {
    let cli = Cli::try_parse().map_err(|e| {
        eprintln!("{e}");
        255
    })?;

    let backing = open_backing(&cli)?;

    let vhd = if cli.novhd {
        None
    } else {
        Vhd::detect(&backing).map_err(|e| {
            error!("VHD probe failed: {e}");
            1
        })?
    };

    let physical_size = backing.physical_size().map_err(|e| {
        error!("could not determine backing size: {e}");
        1
    })?;

    let mut image_offset = 0u64;
    let mut file_size = vhd
        .as_ref()
        .map(|v| v.current_size)
        .or(physical_size)
        .unwrap_or(0);

    if let Some(raw) = &cli.size_or_partno {
        if looks_like_partition_index(raw) {
            let n: u32 = raw.parse().map_err(|_| {
                error!("bad partition index {raw:?}");
                1
            })?;
            match partition::resolve(&backing, n).map_err(|e| {
                error!("partition resolution failed: {e}");
                1
            })? {
                Some((off, len)) => {
                    image_offset = off;
                    file_size = len;
                }
                None => {
                    info!("no MBR present, image covers the entire backing store");
                }
            }
        } else {
            file_size = parse_size(raw).map_err(|e| {
                error!("bad size argument: {e}");
                255
            })?;
        }
    }

    // image_offset argument is only consulted when the partition resolver
    // did not already produce a nonzero offset (spec.md §9 open questions:
    // preserve this quirk rather than "fixing" it).
    if image_offset == 0 {
        if let Some(raw) = &cli.offset {
            image_offset = parse_size(raw).map_err(|e| {
                error!("bad offset argument: {e}");
                255
            })?;
        }
    }

    let req_alignment = cli
        .align
        .as_deref()
        .map(parse_size)
        .transpose()
        .map_err(|e| {
            error!("bad alignment argument: {e}");
            255
        })?
        .unwrap_or(1);

    let buffer_size = cli
        .bufsize
        .as_deref()
        .map(parse_size)
        .transpose()
        .map_err(|e| {
            error!("bad bufsize argument: {e}");
            255
        })?
        .unwrap_or(DEFAULT_BUFFER_SIZE as u64) as usize;

    let mut flags = 0u64;
    if cli.read_only {
        flags |= READ_ONLY;
    }

    let geometry = Geometry {
        physical_size: physical_size.unwrap_or(file_size),
        current_size: vhd.as_ref().map(|v| v.current_size).unwrap_or(file_size),
        image_offset,
        file_size,
        req_alignment,
        flags,
    };
    info!(
        "geometry: file_size={} image_offset={} align={} read_only={} vhd={}",
        geometry.file_size,
        geometry.image_offset,
        geometry.req_alignment,
        cli.read_only,
        vhd.is_some()
    );

    let mut io = LogicalIo { geometry, vhd };
    let mut transport = open_transport(&cli, buffer_size)?;
    let mut buffers = Buffers::new(buffer_size);

    loop {
        let mut engine = Engine {
            transport: transport.as_mut(),
            backing: &backing,
            io: &mut io,
            buffers: &mut buffers,
        };
        match engine.run_one() {
            Ok(Step::Continue) => continue,
            Ok(Step::Eof) => {
                info!("client disconnected, shutting down cleanly");
                return Ok(0);
            }
            Err(e) => {
                error!("session terminated: {e}");
                return Err(2);
            }
        }
    }
}

fn open_backing(cli: &Cli) -> Result<Backing, i32> {
    if let Some(spec) = &cli.dll {
        return Backing::open_plugin(spec, cli.read_only).map_err(|e| {
            error!("plugin open failed: {e}");
            1
        });
    }
    Backing::open_file(&cli.image, cli.read_only).map_err(|e| {
        error!("could not open {}: {e}", cli.image.display());
        1
    })
}

fn open_transport(cli: &Cli, buffer_size: usize) -> Result<Box<dyn Transport>, i32> {
    if cli.drv {
        #[cfg(all(target_os = "linux", feature = "kdrv"))]
        {
            let path = cli
                .comm
                .strip_prefix("drv:")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&cli.comm));
            let t = bdproxy::transport::kdrv::KdrvTransport::open(&path, buffer_size)
                .map_err(|e| {
                    error!("kernel-driver transport open failed: {e}");
                    2
                })?;
            return Ok(Box::new(t));
        }
        #[cfg(not(all(target_os = "linux", feature = "kdrv")))]
        {
            error!("kernel-driver transport not built into this binary (enable the kdrv feature)");
            return Err(2);
        }
    }

    if let Some(name) = cli.comm.strip_prefix("shm:") {
        #[cfg(target_os = "linux")]
        {
            let t = bdproxy::transport::shm::ShmTransport::open(name, buffer_size).map_err(|e| {
                error!("shared-memory transport open failed: {e}");
                2
            })?;
            return Ok(Box::new(t));
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = name;
            error!("shared-memory transport is only available on linux");
            return Err(2);
        }
    }

    if cli.comm == "-" {
        return Ok(Box::new(SocketTransport::stdio()));
    }

    if let Ok(port) = cli.comm.parse::<u16>() {
        return SocketTransport::listen_tcp(port)
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .map_err(|e| {
                error!("TCP listen on port {port} failed: {e}");
                2
            });
    }

    SocketTransport::listen_unix(&PathBuf::from(&cli.comm))
        .map(|t| Box::new(t) as Box<dyn Transport>)
        .map_err(|e| {
            error!("unix socket listen on {} failed: {e}", cli.comm);
            2
        })
}

/// Heuristic distinguishing a bare partition index from a size literal:
/// digits only, no suffix, and small enough to be a plausible 1-based
/// MBR/EBR partition number (spec.md §4.2: `n ∈ [1, 511]`).
fn looks_like_partition_index(raw: &str) -> bool {
    raw.chars().all(|c| c.is_ascii_digit())
        && raw
            .parse::<u32>()
            .map(|n| (1..=511).contains(&n))
            .unwrap_or(false)
}
