use std::io;

/// Error taxonomy for the proxy core (DESIGN NOTES "Error returns").
///
/// Protocol/transport errors and backing I/O errors are handled at
/// different layers: a [`ProxyError`] that reaches the session loop ends
/// the session, one that is caught inside a request handler is packaged
/// into the response's `errorno` field instead.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// A framed read or write did not transfer the expected number of
    /// bytes and the transport cannot be retried further.
    #[error("short I/O on transport")]
    ShortIo,

    /// The backing store returned an OS-level error.
    #[error("backing store I/O error: {0}")]
    BackingIo(#[source] io::Error),

    /// A structural assumption about an on-disk format did not hold
    /// (bad MBR signature, VHD autodetect mismatch, non-power-of-two
    /// block size, ...).
    #[error("bad format: {0}")]
    BadFormat(String),

    /// An operation was refused by policy (write to a read-only image).
    #[error("policy violation")]
    PolicyViolation,

    /// The transport's peer went away between requests.
    #[error("transport closed")]
    TransportClosed,

    /// A resource (mapping, mutex, buffer) could not be allocated.
    #[error("allocation failure: {0}")]
    AllocFailure(String),
}

impl ProxyError {
    /// The platform errno this error should be reported as in a wire
    /// response, when it has a natural one.
    pub fn errno(&self) -> i32 {
        match self {
            ProxyError::BackingIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ProxyError::PolicyViolation => libc::EBADF,
            ProxyError::BadFormat(_) => libc::EINVAL,
            ProxyError::AllocFailure(_) => libc::ENOMEM,
            ProxyError::ShortIo | ProxyError::TransportClosed => libc::EIO,
        }
    }
}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        ProxyError::BackingIo(e)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
