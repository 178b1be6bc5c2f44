//! Branch hints usable on stable rust.
//!
//! `core::intrinsics::{likely, unlikely}` are not available on stable, so the hints are expressed by
//! routing the cold side of a branch through a `#[cold]` function.

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn _cold() {}

#[doc(hidden)]
#[inline(always)]
pub fn _unlikely(b: bool) -> bool {
    if b {
        _cold()
    }
    b
}

#[doc(hidden)]
#[inline(always)]
pub fn _likely(b: bool) -> bool {
    if !b {
        _cold()
    }
    b
}

macro_rules! unlikely {
    ($e:expr) => {
        $crate::internal::optim::_unlikely($e)
    };
}

macro_rules! likely {
    ($e:expr) => {{
        $crate::internal::optim::_likely($e)
    }};
}

/// Checks an engine invariant. Unlike `debug_assert!`, violations are fatal in release builds too.
macro_rules! invariant {
    ($e:expr, $msg:expr) => {
        if unlikely!(!$e) {
            $crate::error::fatal($crate::error::FatalError::Invariant($msg))
        }
    };
}
