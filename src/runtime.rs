//! The runtime handle.

use crate::{
    config::Config,
    error::{ConfigError, ShutdownError},
    host::Host,
    internal::state::RuntimeState,
    stats::Stats,
    thread_key::ThreadKey,
    vm::{SimulatedMemory, VirtualMemory},
};
use core::fmt::{self, Debug, Formatter};
use std::sync::{atomic::Ordering::Relaxed, Arc};
use tracing::info;

/// Old generation usage, as last accounted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapUsage {
    /// Bytes of old objects, including garbage not yet collected.
    pub bytes_in_use:      usize,
    /// Memory held by the commit log. Counts toward `threshold` as well.
    pub commit_log_bytes:  usize,
    /// Usage at which the next major collection is requested.
    pub threshold:         usize,
    /// Completed major collections.
    pub major_collections: u64,
    /// Pages holding committed data.
    pub committed_pages:   usize,
}

/// A transactional heap shared by the threads registered with it.
///
/// # Examples
///
/// ```
/// use segstm::{
///     config::Config,
///     host::{Host, ObjectHeader, ObjectView},
///     runtime::Runtime,
/// };
/// use std::sync::Arc;
///
/// struct Counters;
///
/// impl Host for Counters {
///     fn size_of(&self, _: ObjectHeader) -> usize {
///         16
///     }
///
///     fn trace(&self, _: ObjectView<'_>, _: &mut dyn FnMut(usize)) {}
/// }
///
/// let runtime = Runtime::new(Config::default(), Arc::new(Counters)).unwrap();
/// let thread = runtime.register_thread();
///
/// let counter = thread.allocate_preexisting(1, &[0; 8]);
/// thread.rw(|tx| {
///     let n = tx.get(counter, 8)?;
///     tx.set(counter, 8, n + 1)
/// });
/// assert_eq!(thread.rw(|tx| tx.get(counter, 8)), 1);
///
/// drop(thread);
/// runtime.shutdown().unwrap();
/// ```
pub struct Runtime {
    state: Arc<RuntimeState>,
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state)
            .finish()
    }
}

impl Runtime {
    /// Creates a runtime backed by [`SimulatedMemory`].
    pub fn new<H: Host>(config: Config, host: Arc<H>) -> Result<Self, ConfigError> {
        Self::with_memory(config, host, || {
            Box::new(SimulatedMemory::new()) as Box<dyn VirtualMemory>
        })
    }

    /// Creates a runtime whose segments get their memory from `memory`, called once per segment.
    pub fn with_memory<H, M>(config: Config, host: Arc<H>, memory: M) -> Result<Self, ConfigError>
    where
        H: Host,
        M: Fn() -> Box<dyn VirtualMemory>,
    {
        config.validate()?;
        info!(
            target: "segstm",
            segments = config.segments,
            nursery_size = config.nursery_size,
            heap_size = config.heap_size,
            "runtime initialized"
        );
        Ok(Runtime {
            state: Arc::new(RuntimeState::new(config, host, &memory)),
        })
    }

    /// Registers the calling thread. Dropping the returned key unregisters it.
    pub fn register_thread(&self) -> ThreadKey {
        ThreadKey::new(self.state.clone())
    }

    /// Requests a major collection at the next safe point of any thread.
    pub fn request_major_collection(&self) {
        self.state.request_major_collection()
    }

    pub fn heap_usage(&self) -> HeapUsage {
        HeapUsage {
            bytes_in_use:      self.state.bytes_in_use.load(Relaxed),
            commit_log_bytes:  self.state.log_bytes.load(Relaxed),
            threshold:         self.state.threshold.load(Relaxed),
            major_collections: self.state.gc.lock().collections,
            committed_pages:   self.state.shared.read().committed_pages(),
        }
    }

    /// Counters of all finished transactions. Empty unless the `stats` feature is enabled.
    pub fn stats(&self) -> Stats {
        self.state.stats.lock().clone()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Tears the runtime down. Every [`ThreadKey`] must have been dropped.
    pub fn shutdown(self) -> Result<(), ShutdownError> {
        let registered = self.state.threads.lock().len();
        if registered > 0 {
            return Err(ShutdownError::ThreadsRegistered(registered));
        }
        let others = Arc::strong_count(&self.state) - 1;
        if others > 0 {
            return Err(ShutdownError::StillShared(others));
        }
        debug_assert!(self.state.pool.all_free(self.state.segments.len()));
        for seg in self.state.segments.iter() {
            seg.data.lock().unmap_all();
        }
        let usage = self.heap_usage();
        info!(
            target: "segstm",
            bytes_in_use = usage.bytes_in_use,
            major_collections = usage.major_collections,
            "runtime shut down"
        );
        Ok(())
    }
}
