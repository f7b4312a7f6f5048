//! Stable error kinds (§7). Allocation and span-layer errors from [`cache`] are folded in
//! rather than re-declared.

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,
    #[error("requested alignment is invalid")]
    AlignmentInvalid,
    #[error("arithmetic overflow computing a size")]
    Overflow,
    #[error("async queue is full")]
    QueueFull,
    #[error("operation timed out")]
    Timeout,
    #[error("fiber observed a cancel request")]
    Canceled,
    #[error("operation attempted on a closed sink")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("runtime invariant violated: {0}")]
    Fatal(&'static str),
}

impl From<cache::Error> for Error {
    fn from(err: cache::Error) -> Self {
        match err {
            cache::Error::OutOfMemory => Error::OutOfMemory,
            cache::Error::AlignmentInvalid(_) => Error::AlignmentInvalid,
            cache::Error::Overflow => Error::Overflow,
            cache::Error::Fatal(msg) => Error::Fatal(msg),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Aborts the process. `FATAL` is defined as unrecoverable (§7): once a caller observes it,
/// there is no well-defined state to continue from.
#[cold]
#[inline(never)]
pub fn abort_on_fatal(msg: &'static str) -> ! {
    tracing::error!(%msg, "fatal invariant violated, aborting");
    std::process::abort()
}
