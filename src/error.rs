use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// Every fallible entry point returns one of these; callers that need richer
/// context (a file path, a query description) are expected to wrap this in
/// their own error type rather than the engine growing one for them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A backing file syscall (open, read, write, resize, fsync) failed.
    #[error("backing file I/O failed")]
    FileError(#[source] std::io::Error),

    /// Couldn't take the exclusive file lock that guards single-process access.
    #[error("failed to lock the database file for exclusive access")]
    Lock(#[source] std::io::Error),

    /// A commit's apply phase failed after the journal record was already
    /// fsynced. The database cannot be trusted until the process restarts and
    /// replays the journal.
    #[error(
        "database is wedged after a failed commit apply; restart the process to replay the journal"
    )]
    Wedged,

    /// On-disk bytes violate a storage invariant: bad magic, a free-list
    /// cycle, an out-of-range `next` pointer, a corrupt journal record.
    #[error("on-disk data violates a storage invariant: {0}")]
    ConsistencyError(String),

    /// The value tree handed to `stage_write`/`commit` by the serializer
    /// can't be represented on disk.
    #[error("value tree is not representable on disk: {0}")]
    ModelError(String),

    /// The caller passed a malformed request: an oversize short read, a
    /// `free(addr)` that doesn't point at a block header, an unaligned page
    /// request.
    #[error("invalid request: {0}")]
    BadArgument(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
