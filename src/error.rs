use std::io;

use thiserror::Error;

/// Errors surfaced by the worker and registry APIs.
///
/// Backend connection failures are not errors of this type: they are
/// [`crate::backend::BackendError`] values handed to the owning session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not create epoll instance: {0}")]
    Epoll(#[source] io::Error),

    #[error("worker count {0} is outside 1..={max}", max = crate::config::MAX_WORKERS)]
    WorkerCount(usize),

    #[error("routing worker {id} could not be started: {source}")]
    WorkerStart {
        id: usize,
        #[source]
        source: io::Error,
    },

    #[error("workers have already been started")]
    AlreadyStarted,

    #[error("workers have not been started")]
    NotStarted,

    #[error("no such routing worker: {0}")]
    NoSuchWorker(usize),

    #[error("mailbox of routing worker {0} is full")]
    MailboxFull(usize),

    #[error("cannot wait for workers from inside routing worker {0}")]
    CalledFromWorker(usize),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("backend connection cannot be reused: {0}")]
    NotReusable(&'static str),

    #[error("unknown descriptor {0}")]
    UnknownDcb(usize),

    #[error("unknown session {0}")]
    UnknownSession(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether retrying the failed operation could succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Socket errors, hang-ups, rejected handshakes.
    Transient,
    /// Malformed packets, failed init queries, failed re-authentication.
    Permanent,
}
