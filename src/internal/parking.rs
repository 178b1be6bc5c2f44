//! Parking for transactions blocked behind an inevitable transaction.
//!
//! The address of the inevitable slot is the parking key. Waiters always park with a timeout so they
//! get back to their safe points even if nobody unparks them.

use parking_lot_core::{ParkResult, ParkToken, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::{
    sync::atomic::{AtomicUsize, Ordering::Acquire},
    time::{Duration, Instant},
};

/// Parks while `slot` still holds `owner`, for at most `timeout`. Returns whether the thread was
/// woken by [`unpark_all`].
#[inline(never)]
#[cold]
pub fn park_while_owned(slot: &AtomicUsize, owner: usize, timeout: Duration) -> bool {
    let key = slot as *const _ as usize;
    let validate = || slot.load(Acquire) == owner;
    let before_sleep = || {};
    let timed_out = |_, _| {};
    let token: ParkToken = DEFAULT_PARK_TOKEN;
    let result = unsafe {
        parking_lot_core::park(
            key,
            validate,
            before_sleep,
            timed_out,
            token,
            Some(Instant::now() + timeout),
        )
    };
    match result {
        ParkResult::Unparked(token) => {
            debug_assert_eq!(token, DEFAULT_UNPARK_TOKEN);
            true
        }
        ParkResult::Invalid | ParkResult::TimedOut => false,
    }
}

/// Wakes every thread parked on `slot`.
#[inline(never)]
#[cold]
pub fn unpark_all(slot: &AtomicUsize) -> usize {
    let key = slot as *const _ as usize;
    unsafe { parking_lot_core::unpark_all(key, DEFAULT_UNPARK_TOKEN) }
}
