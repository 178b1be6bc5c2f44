//! Transaction outcome types.
//!
//! A transaction body returns `Result<O, Error>`. Every barrier, allocation and safe point may fail
//! with an [`Error`], which should be propagated with `?`. [`ThreadKey::rw`] then aborts the attempt
//! and runs the body again.
//!
//! [`ThreadKey::rw`]: crate::thread_key::ThreadKey::rw

use core::fmt::{self, Debug, Display, Formatter};

/// Why a transaction was aborted. Used for diagnostics only, every reason is handled by a retry.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AbortReason {
    /// A read found that another transaction committed a change to something already read.
    ValidateInflight,
    /// Commit time validation found a change to something read.
    ValidateCommit,
    /// Another transaction committed a change to an object this transaction also modified.
    WriteWrite,
    /// The transaction could not become inevitable without waiting.
    Inevitable,
    /// Requested by the host.
    Manual,
    /// A concurrent major collection found this transaction conflicting and aborted it.
    MajorGc,
}

/// Coarse grouping of [`AbortReason`]s.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ConflictCategory {
    WriteRead,
    WriteWrite,
    Inevitable,
    Manual,
    GcTriggered,
}

impl AbortReason {
    #[inline]
    pub fn category(self) -> ConflictCategory {
        match self {
            AbortReason::ValidateInflight | AbortReason::ValidateCommit => {
                ConflictCategory::WriteRead
            }
            AbortReason::WriteWrite => ConflictCategory::WriteWrite,
            AbortReason::Inevitable => ConflictCategory::Inevitable,
            AbortReason::Manual => ConflictCategory::Manual,
            AbortReason::MajorGc => ConflictCategory::GcTriggered,
        }
    }

    pub(crate) const ALL: [AbortReason; 6] = [
        AbortReason::ValidateInflight,
        AbortReason::ValidateCommit,
        AbortReason::WriteWrite,
        AbortReason::Inevitable,
        AbortReason::Manual,
        AbortReason::MajorGc,
    ];

    #[inline]
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            AbortReason::ValidateInflight => 1,
            AbortReason::ValidateCommit => 2,
            AbortReason::WriteWrite => 3,
            AbortReason::Inevitable => 4,
            AbortReason::Manual => 5,
            AbortReason::MajorGc => 6,
        }
    }

    #[inline]
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.to_u8() == v)
    }
}

impl Display for AbortReason {
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::ValidateInflight => "VALIDATE_INFLIGHT",
            AbortReason::ValidateCommit => "VALIDATE_COMMIT",
            AbortReason::WriteWrite => "write-write conflict",
            AbortReason::Inevitable => "inevitable conflict",
            AbortReason::Manual => "manual",
            AbortReason::MajorGc => "GC-triggered",
        };
        f.pad(s)
    }
}

/// The error type of transactional operations: the transaction must be aborted and retried.
#[derive(thiserror::Error, PartialEq, Eq, Clone, Copy)]
#[error("transaction aborted: {reason}")]
pub struct Error {
    reason: AbortReason,
}

impl Debug for Error {
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error").field("reason", &self.reason).finish()
    }
}

impl Error {
    /// Requests that the transaction be aborted and retried.
    ///
    /// # Examples
    ///
    /// ```
    /// use segstm::tx::{AbortReason, Error};
    ///
    /// assert_eq!(Error::RETRY.reason(), AbortReason::Manual);
    /// ```
    pub const RETRY: Self = Error {
        reason: AbortReason::Manual,
    };

    #[inline]
    pub(crate) const fn new(reason: AbortReason) -> Self {
        Error { reason }
    }

    #[inline]
    pub fn reason(self) -> AbortReason {
        self.reason
    }
}

impl From<AbortReason> for Error {
    #[inline]
    fn from(reason: AbortReason) -> Self {
        Error::new(reason)
    }
}
