//! Errors that are not transaction conflicts.
//!
//! Conflicts are reported through [`tx::Error`](crate::tx::Error) and retried. Everything in this
//! module is either a usage error reported to the caller ([`ConfigError`], [`ShutdownError`]), or a
//! [`FatalError`], which terminates the process.

use thiserror::Error;

/// An invalid [`Config`](crate::config::Config).
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`segments` must be between 1 and {max}, got {got}")]
    Segments { got: usize, max: usize },

    #[error("`{field}` must be a non-zero multiple of the page size, got {got}")]
    NotPageMultiple { field: &'static str, got: usize },

    #[error("`{field}` is out of range: {reason}")]
    OutOfRange {
        field:  &'static str,
        reason: &'static str,
    },

    #[error("environment variable `{var}` has an unparsable value `{value}`")]
    Env { var: &'static str, value: String },
}

/// Returned by [`Runtime::shutdown`](crate::runtime::Runtime::shutdown) when the runtime is still
/// in use.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("{0} threads are still registered")]
    ThreadsRegistered(usize),

    #[error("the runtime is still referenced by {0} other handles")]
    StillShared(usize),
}

/// Unrecoverable conditions. The heap can not be trusted after one of these, so they are never
/// returned to the host.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("old space exhausted while allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("an inevitable transaction can not be aborted ({0:?})")]
    InevitableAbort(crate::tx::AbortReason),

    #[error("heap invariant violated: {0}")]
    Invariant(&'static str),
}

/// Reports `err` and terminates the process.
#[cold]
#[inline(never)]
pub(crate) fn fatal(err: FatalError) -> ! {
    tracing::error!(target: "segstm", error = %err, "fatal error, aborting");
    std::process::abort()
}
