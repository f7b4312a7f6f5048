#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,
    #[error("requested alignment {0} is not a power of two or exceeds half a span")]
    AlignmentInvalid(usize),
    #[error("arithmetic overflow computing allocation size")]
    Overflow,
    #[error("heap invariant violated: {0}")]
    Fatal(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;
