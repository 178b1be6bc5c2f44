#[macro_use]
pub mod optim;

pub mod alloc;
pub mod barrier;
pub mod commit_log;
pub mod frw_lock;
pub mod read_markers;
pub mod segment;
pub mod state;
pub mod thread;
pub mod undo_log;

mod commit;
mod gc;
mod nursery;
mod parking;

pub use self::gc::GcState;
