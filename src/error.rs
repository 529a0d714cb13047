use std::io;

use thiserror::Error;

use crate::storage::page::PageId;

/// Which half of the disk conversation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Sync,
}

/// The crate-wide error type. All operations bubble one of these to the
/// operation boundary; network and CLI layers translate them to their own
/// protocols.
#[derive(Error, Debug)]
pub enum ShoalError {
    #[error("not found")]
    NotFound,

    #[error("unique constraint violated")]
    UniqueViolation,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{kind:?} error on page {page_id:?}: {source}")]
    Io {
        kind: IoKind,
        page_id: Option<PageId>,
        source: io::Error,
    },

    #[error("corrupted page {page_id}: {detail}")]
    Corruption { page_id: PageId, detail: String },

    #[error("clock error: {0}")]
    Clock(String),

    #[error("buffer pool exhausted, all frames pinned")]
    OutOfMemory,

    #[error("bulk load input not sorted")]
    NotSorted,
}

impl ShoalError {
    pub fn io(kind: IoKind, page_id: Option<PageId>, source: io::Error) -> Self {
        ShoalError::Io {
            kind,
            page_id,
            source,
        }
    }

    pub fn read_err(page_id: PageId, source: io::Error) -> Self {
        Self::io(IoKind::Read, Some(page_id), source)
    }

    pub fn write_err(page_id: PageId, source: io::Error) -> Self {
        Self::io(IoKind::Write, Some(page_id), source)
    }

    pub fn sync_err(source: io::Error) -> Self {
        Self::io(IoKind::Sync, None, source)
    }
}
