//! The error type used throughout the crate.

use thiserror::Error;

/// The result type used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// An error produced while loading, verifying, translating, or running a
/// program.
///
/// Every variant formats to a human-readable message; callers that only
/// want text can use `to_string`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The image is structurally invalid: bad magic, sizes, or section
    /// bounds.
    #[error("{0}")]
    MalformedImage(String),

    /// The image is well-formed but not of the kind this crate accepts:
    /// wrong class, endianness, machine, or OS ABI.
    #[error("{0}")]
    UnsupportedImage(String),

    /// No main function was identified in the image.
    #[error("{0} function not found")]
    MissingEntry(String),

    /// A relocation could not be applied.
    #[error("{0}")]
    BadRelocation(String),

    /// The program violates a structural rule checked after load.
    #[error("{0}")]
    VerifierRejected(String),

    /// Execution hit a fatal condition: a failed bounds check, call depth
    /// exhaustion, or an opcode the verifier never saw.
    #[error("{0}")]
    RuntimeFault(String),

    /// Translation to native code failed.
    #[error("{0}")]
    TranslatorFault(String),

    /// An allocation failed.
    #[error("out of memory")]
    ResourceExhausted,

    /// Code has already been loaded into this VM. Unload it first.
    #[error("code has already been loaded into this VM; unload first")]
    AlreadyLoaded,

    /// The operation requires a loaded program.
    #[error("no program has been loaded into this VM")]
    NotLoaded,

    /// A registration argument was rejected.
    #[error("{0}")]
    InvalidRegistration(String),
}
