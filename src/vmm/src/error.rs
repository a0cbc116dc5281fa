use std::io;

/// Errors surfaced by the monitor. The taxonomy is deliberately small:
/// everything a caller can react to is one of these kinds, with detail
/// carried in the payload.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A host allocation or a hypervisor registration failed.
    #[error("host resources exhausted while {0}: {1}")]
    Resource(&'static str, #[source] io::Error),
    /// A binary or trampoline blob could not be parsed.
    #[error("malformed input: {0}")]
    Format(String),
    /// The binary is well-formed but outside what the monitor runs.
    #[error("unsupported binary: {0}")]
    Unsupported(String),
    /// A guest address has no mapping.
    #[error("guest address {0:#x} does not translate")]
    Translation(u64),
    /// A page-table edit contradicts an existing mapping.
    #[error("mapping conflict at guest address {0:#x}")]
    Conflict(u64),
    /// Unrecoverable guest state; the run loop stops.
    #[error("fatal guest state: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn os(context: &'static str) -> Self {
        Error::Resource(context, io::Error::last_os_error())
    }
}
