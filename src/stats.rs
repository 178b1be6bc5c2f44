//! Statistics collection. Enabled with `--features stats`.
//!
//! Every segment records into its own [`Stats`], which is merged into the runtime's totals when the
//! transaction running on it finishes. Without the feature, recording compiles to nothing and
//! [`Runtime::stats`](crate::Runtime::stats) returns all zeros.

use std::fmt::{self, Debug, Formatter};

#[derive(Copy, Clone, Default, Debug)]
struct MinMaxTotal {
    min:   u64,
    max:   u64,
    total: u64,
}

#[doc(hidden)]
#[derive(Default, Clone)]
pub struct Size {
    min_max_total: Option<MinMaxTotal>,
    count:         u64,
}

impl Debug for Size {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Size")
            .field("count", &self.count)
            .field("min", &self.min_max_total.map(|x| x.min))
            .field("max", &self.min_max_total.map(|x| x.max))
            .field("total", &self.min_max_total.map(|x| x.total))
            .field(
                "avg",
                &self
                    .min_max_total
                    .map(|x| x.total as f64 / self.count as f64),
            )
            .finish()
    }
}

impl Size {
    pub(crate) fn record(&mut self, size: u64) {
        self.count += 1;
        if let Some(ref mut min_max_total) = &mut self.min_max_total {
            min_max_total.min = min_max_total.min.min(size);
            min_max_total.max = min_max_total.max.max(size);
            min_max_total.total += size;
        } else {
            self.min_max_total = Some(MinMaxTotal {
                min:   size,
                max:   size,
                total: size,
            });
        }
    }

    pub(crate) fn merge(&mut self, rhs: &Self) {
        self.count += rhs.count;
        self.min_max_total = match (self.min_max_total, rhs.min_max_total) {
            (Some(a), Some(b)) => Some(MinMaxTotal {
                min:   a.min.min(b.min),
                max:   a.max.max(b.max),
                total: a.total + b.total,
            }),
            (a, b) => a.or(b),
        };
    }

    /// Number of recorded values.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of the recorded values.
    pub fn total(&self) -> u64 {
        self.min_max_total.map(|x| x.total).unwrap_or(0)
    }
}

#[doc(hidden)]
#[derive(Default, Debug, Clone)]
pub struct Event {
    count: u64,
}

impl Event {
    fn happened(&mut self) {
        self.count += 1
    }

    fn merge(&mut self, rhs: &Self) {
        self.count += rhs.count
    }

    /// Number of times the event happened.
    pub fn count(&self) -> u64 {
        self.count
    }
}

macro_rules! stats_func {
    ($(#[$attr:meta])* $name:ident: Event) => {
        #[inline]
        $(#[$attr])*
        pub(crate) fn $name(&mut self) {
            if cfg!(feature = "stats") {
                self.$name.happened()
            }
        }
    };
    ($(#[$attr:meta])* $name:ident: Size) => {
        #[inline]
        $(#[$attr])*
        pub(crate) fn $name(&mut self, size: usize) {
            if cfg!(feature = "stats") {
                self.$name.record(size as u64)
            }
        }
    };
}

macro_rules! stats {
    ($($(#[$attr:meta])* $names:ident: $kinds:tt),* $(,)*) => {
        /// Counters collected by a runtime.
        #[derive(Default, Debug, Clone)]
        pub struct Stats {
            $($(#[$attr])* pub $names: $kinds),*
        }

        impl Stats {
            pub(crate) fn merge(&mut self, rhs: &Self) {
                $(self.$names.merge(&rhs.$names));*
            }

            $(stats_func!{$(#[$attr])* $names: $kinds})*
        }
    };
}

stats! {
    /// Number of retries per successful transaction.
    transaction_retries:      Size,

    /// Number of undo slices per committing transaction.
    undo_slices:              Size,

    /// Number of commit log records per committing transaction.
    commit_records:           Size,

    /// A read barrier found a conflict with a newer commit.
    abort_validate_inflight:  Event,

    /// A committing transaction found a conflict with a newer commit.
    abort_validate_commit:    Event,

    /// Two transactions wrote the same object.
    abort_write_write:        Event,

    /// A transaction could not become inevitable without waiting.
    abort_inevitable:         Event,

    /// The program aborted the transaction.
    abort_manual:             Event,

    /// A major collection forced the transaction to abort.
    abort_major_gc:           Event,

    /// An old page was copied into a segment on first access.
    privatized_pages:         Event,

    /// Number of commit log entries checked per validation.
    validated_entries:        Size,

    /// A committing transaction waited for an inevitable transaction to finish.
    inevitable_waits:         Event,

    /// A thread waited for a free segment.
    segment_waits:            Event,

    /// A minor collection ran.
    minor_collections:        Event,

    /// Bytes moved out of the nursery per minor collection.
    minor_survivor_bytes:     Size,

    /// A major collection ran.
    major_collections:        Event,

    /// Bytes freed per major collection.
    major_freed_bytes:        Size,

    /// A finalizer ran.
    finalizers_run:           Event,
}

impl Stats {
    pub(crate) fn abort(&mut self, reason: crate::tx::AbortReason) {
        use crate::tx::AbortReason::*;
        match reason {
            ValidateInflight => self.abort_validate_inflight(),
            ValidateCommit => self.abort_validate_commit(),
            WriteWrite => self.abort_write_write(),
            Inevitable => self.abort_inevitable(),
            Manual => self.abort_manual(),
            MajorGc => self.abort_major_gc(),
        }
    }

    /// Total number of aborted transactions.
    pub fn aborts(&self) -> u64 {
        self.abort_validate_inflight.count()
            + self.abort_validate_commit.count()
            + self.abort_write_write.count()
            + self.abort_inevitable.count()
            + self.abort_manual.count()
            + self.abort_major_gc.count()
    }

    /// Prints the collected statistics to stdout.
    pub fn print_summary(&self) {
        if cfg!(feature = "stats") {
            println!("{:#?}", self);
        }
    }
}
