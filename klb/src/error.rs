use thiserror::Error;

use klb_ebpf_common::{BackendId, ServiceId};

use crate::maps::registry::TableError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("{0}")]
    Ebpf(String),

    #[error("unknown service: {0}")]
    UnknownService(ServiceId),

    #[error("unknown backend: {0}")]
    UnknownBackend(BackendId),

    #[error("backend {backend_id} still referenced by services {referenced_by:?}")]
    BackendInUse {
        backend_id: BackendId,
        referenced_by: Vec<ServiceId>,
    },

    #[error("table {table} is full")]
    CapacityExceeded { table: &'static str },

    #[error("transient error: {0}")]
    Transient(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<aya::EbpfError> for Error {
    fn from(err: aya::EbpfError) -> Self {
        Self::Ebpf(err.to_string())
    }
}

impl Error {
    /// Whether a kernel write that failed with this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Map(aya::maps::MapError::SyscallError(e)) => matches!(
                e.io_error.raw_os_error(),
                Some(code) if code == nix::errno::Errno::EAGAIN as i32
                    || code == nix::errno::Errno::EBUSY as i32
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
