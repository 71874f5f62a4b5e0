use std::fmt;

/// The crate-wide fatal/recoverable taxonomy. Pipelines return `anyhow::Result`
/// almost everywhere (the teacher's idiom), but the worker framework needs to
/// distinguish a handful of conditions from an ordinary per-file `IoError` by
/// downcasting at its single catch point rather than string-sniffing messages.
#[derive(Debug)]
pub enum DepotError {
    Io(String),
    Parse { path: String, line: usize, message: String },
    DepotFull,
    Index(String),
    Canceled,
    ResumeInvalid(String),
}

impl fmt::Display for DepotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepotError::Io(msg) => write!(f, "io error: {msg}"),
            DepotError::Parse { path, line, message } => {
                write!(f, "parse error in {path}:{line}: {message}")
            }
            DepotError::DepotFull => write!(f, "depot full: no root has space for reservation"),
            DepotError::Index(msg) => write!(f, "index error: {msg}"),
            DepotError::Canceled => write!(f, "canceled"),
            DepotError::ResumeInvalid(msg) => write!(f, "resume invalid: {msg}"),
        }
    }
}

impl std::error::Error for DepotError {}

impl DepotError {
    /// `DepotFull` and `Canceled` are the only conditions that abort an
    /// entire job; every other per-unit error is logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DepotError::DepotFull | DepotError::Canceled)
    }

    pub fn downcast_from(err: &anyhow::Error) -> Option<&DepotError> {
        err.downcast_ref::<DepotError>()
    }
}
