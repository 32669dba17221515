use crate::fabric::CompletionFlags;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// errno values reported to the shell, numbered the way libfabric numbers them.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOSYS: i32 = 38;
    pub const ENODATA: i32 = 61;
    pub const EMSGSIZE: i32 = 90;
    pub const EADDRNOTAVAIL: i32 = 99;
    pub const ENOTCONN: i32 = 107;
    pub const ETIMEDOUT: i32 = 110;
    pub const EOTHER: i32 = 256;
    pub const ETOOSMALL: i32 = 257;
    pub const EOPBADSTATE: i32 = 258;
}

/// Errors reported by a fabric provider.
///
/// `Again` is the transient "would block" signal. The retry loops in this crate consume it and
/// never hand it to the caller.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("resource temporarily unavailable")]
    Again,
    #[error("buffer too small, {required} bytes required")]
    TooSmall { required: usize },
    #[error("malformed endpoint address")]
    InvalidAddress,
    #[error("no space left in {0}")]
    NoSpace(&'static str),
    #[error("endpoint is not enabled")]
    NotEnabled,
    #[error("memory region has an operation in flight")]
    Busy,
    #[error("unknown memory region or address handle")]
    BadHandle,
    #[error("memory region lacks the access this operation needs")]
    PermissionDenied,
    #[error("message of {len} bytes exceeds the provider limit of {max}")]
    MessageTooLong { len: usize, max: usize },
    #[error("no provider named {0:?}")]
    NoProvider(String),
    #[error("completion error on context {context:#x} (errno {errno})")]
    Completion { context: u64, errno: i32 },
    #[error("completion on context {context:#x} has unexpected flags {flags:?}")]
    UnexpectedCompletion { context: u64, flags: CompletionFlags },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FabricError {
    #[inline]
    pub fn is_again(&self) -> bool {
        matches!(self, FabricError::Again)
    }

    /// Negative errno for this error.
    pub fn code(&self) -> i32 {
        -match self {
            FabricError::Again => errno::EAGAIN,
            FabricError::TooSmall { .. } => errno::ETOOSMALL,
            FabricError::InvalidAddress => errno::EINVAL,
            FabricError::NoSpace(_) => errno::ENOSPC,
            FabricError::NotEnabled => errno::EOPBADSTATE,
            FabricError::Busy => errno::EBUSY,
            FabricError::BadHandle => errno::EINVAL,
            FabricError::PermissionDenied => errno::EACCES,
            FabricError::MessageTooLong { .. } => errno::EMSGSIZE,
            FabricError::NoProvider(_) => errno::ENODATA,
            FabricError::Completion { errno: code, .. } => code.abs(),
            FabricError::UnexpectedCompletion { .. } => errno::EOTHER,
            FabricError::Io(e) => os_errno(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot resolve {host}:{port}")]
    AddressResolution {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("cannot bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("accept failed")]
    Accept(#[source] io::Error),
    #[error("cannot connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("bootstrap connection closed by peer")]
    ConnectionClosed,
    #[error("bootstrap connection i/o error")]
    Io(#[from] io::Error),
    #[error("endpoint name query failed")]
    NameQuery(#[source] FabricError),
    #[error("address vector insert failed")]
    AddressInsert(#[source] FabricError),
    #[error("barrier token short write: {sent} of {expected} bytes")]
    BarrierProtocol { sent: usize, expected: usize },
    #[error("{op} failed")]
    Transport {
        op: &'static str,
        #[source]
        source: FabricError,
    },
    #[error("{op} timed out after {elapsed:?}")]
    Timeout { op: &'static str, elapsed: Duration },
    #[error("{} teardown step(s) failed", .0.len())]
    Teardown(Vec<Error>),
}

impl Error {
    pub(crate) fn transport(op: &'static str) -> impl FnOnce(FabricError) -> Error {
        move |source| Error::Transport { op, source }
    }

    /// Negative errno mirroring the failing operation, used as the process exit status.
    pub fn code(&self) -> i32 {
        match self {
            Error::AddressResolution { .. } => -errno::EADDRNOTAVAIL,
            Error::Bind { source, .. } | Error::Connect { source, .. } => -os_errno(source),
            Error::Accept(source) | Error::Io(source) => -os_errno(source),
            Error::ConnectionClosed => -errno::ENOTCONN,
            Error::NameQuery(source) => source.code(),
            // A rejected peer address is reported as ENOSYS, not as the provider error.
            Error::AddressInsert(_) => -errno::ENOSYS,
            Error::BarrierProtocol { .. } => -errno::EOTHER,
            Error::Transport { source, .. } => source.code(),
            Error::Timeout { .. } => -errno::ETIMEDOUT,
            Error::Teardown(errors) => errors.first().map_or(-errno::EOTHER, Error::code),
        }
    }
}

fn os_errno(e: &io::Error) -> i32 {
    e.raw_os_error().map_or(errno::EIO, i32::abs)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
