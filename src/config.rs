//! Runtime configuration.
//!
//! [`Config::default`] gives sizes suitable for tests and small programs. [`Config::from_env`]
//! starts from the defaults and applies the `SEGSTM_*` environment variables:
//!
//! * `SEGSTM_SEGMENTS`
//! * `SEGSTM_NURSERY_SIZE`
//! * `SEGSTM_HEAP_SIZE`
//! * `SEGSTM_MAJOR_GC_FACTOR`
//! * `SEGSTM_MIN_MAJOR_THRESHOLD`

use crate::{error::ConfigError, object::OBJECT_ALIGN, vm::PAGE_SIZE};
use std::{str::FromStr, time::Duration};

/// Largest supported number of segments.
pub const MAX_SEGMENTS: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Number of segments, i.e. the number of transactions that can run in parallel.
    pub segments: usize,

    /// Bytes of nursery per segment.
    pub nursery_size: usize,

    /// Bytes of old generation address space, shared by all segments.
    pub heap_size: usize,

    /// Young objects larger than this are allocated directly in the old generation.
    pub large_object_size: usize,

    /// Old objects up to this size use the size-classed page allocator.
    pub small_object_limit: usize,

    /// Number of items covered by one card of a card marked object.
    pub card_size: usize,

    /// Objects smaller than this never use card marking.
    pub min_card_object_size: usize,

    /// After a major collection, the next one is requested once the old generation has grown to
    /// this multiple of the surviving bytes.
    pub major_gc_factor: f64,

    /// Lower bound on the major collection threshold.
    pub min_major_threshold: usize,

    /// How long a waiter sleeps before polling for safe points again.
    pub wait_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            segments:             4,
            nursery_size:         256 * PAGE_SIZE,
            heap_size:            16384 * PAGE_SIZE,
            large_object_size:    8 * PAGE_SIZE,
            small_object_limit:   256,
            card_size:            32,
            min_card_object_size: 1024,
            major_gc_factor:      1.82,
            min_major_threshold:  1024 * PAGE_SIZE,
            wait_interval:        Duration::from_millis(5),
        }
    }
}

lazy_static::lazy_static! {
    static ref ENV_CONFIG: Result<Config, ConfigError> = Config::default().with_env();
}

fn env_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// The default configuration with the `SEGSTM_*` environment overrides applied. The
    /// environment is read once per process.
    pub fn from_env() -> Result<Config, ConfigError> {
        ENV_CONFIG.clone()
    }

    fn with_env(mut self) -> Result<Config, ConfigError> {
        if let Some(v) = env_var("SEGSTM_SEGMENTS")? {
            self.segments = v;
        }
        if let Some(v) = env_var("SEGSTM_NURSERY_SIZE")? {
            self.nursery_size = v;
        }
        if let Some(v) = env_var("SEGSTM_HEAP_SIZE")? {
            self.heap_size = v;
        }
        if let Some(v) = env_var("SEGSTM_MAJOR_GC_FACTOR")? {
            self.major_gc_factor = v;
        }
        if let Some(v) = env_var("SEGSTM_MIN_MAJOR_THRESHOLD")? {
            self.min_major_threshold = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segments == 0 || self.segments > MAX_SEGMENTS {
            return Err(ConfigError::Segments {
                got: self.segments,
                max: MAX_SEGMENTS,
            });
        }
        for &(field, got) in &[
            ("nursery_size", self.nursery_size),
            ("heap_size", self.heap_size),
        ] {
            if got == 0 || got % PAGE_SIZE != 0 {
                return Err(ConfigError::NotPageMultiple { field, got });
            }
        }
        if self.heap_size < 4 * PAGE_SIZE {
            return Err(ConfigError::OutOfRange {
                field:  "heap_size",
                reason: "must be at least 4 pages",
            });
        }
        if self.small_object_limit < OBJECT_ALIGN
            || self.small_object_limit % OBJECT_ALIGN != 0
            || self.small_object_limit > PAGE_SIZE / 4
        {
            return Err(ConfigError::OutOfRange {
                field:  "small_object_limit",
                reason: "must be a multiple of 16 no larger than a quarter page",
            });
        }
        if self.large_object_size > self.nursery_size || self.large_object_size < OBJECT_ALIGN {
            return Err(ConfigError::OutOfRange {
                field:  "large_object_size",
                reason: "must be between 16 bytes and the nursery size",
            });
        }
        if self.card_size < 2 {
            return Err(ConfigError::OutOfRange {
                field:  "card_size",
                reason: "must be at least 2",
            });
        }
        if !(self.major_gc_factor > 1.0) {
            return Err(ConfigError::OutOfRange {
                field:  "major_gc_factor",
                reason: "must be greater than 1",
            });
        }
        Ok(())
    }
}
