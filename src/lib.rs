//! A segment based software transactional memory with an integrated generational garbage
//! collector.
//!
//! `segstm` runs atomic, isolated and retryable transactions over a managed heap of objects shared
//! by many threads. Every running transaction owns a segment: a private view of one logical address
//! space, in which the pages it touches are privatized on first access. Commits append to a
//! process wide commit log; other segments replay the log into their views and abort when a newer
//! commit changed something they have read.
//!
//! # Examples
//!
//! Creating a runtime and registering a thread:
//! ```
//! use segstm::{
//!     config::Config,
//!     host::{Host, ObjectHeader, ObjectView},
//!     runtime::Runtime,
//! };
//! use std::sync::Arc;
//!
//! /// Every object is a header followed by one reference field.
//! struct Cons;
//!
//! impl Host for Cons {
//!     fn size_of(&self, _: ObjectHeader) -> usize {
//!         16
//!     }
//!
//!     fn trace(&self, _: ObjectView<'_>, visit: &mut dyn FnMut(usize)) {
//!         visit(8)
//!     }
//! }
//!
//! let runtime = Runtime::new(Config::default(), Arc::new(Cons)).unwrap();
//! let thread = runtime.register_thread();
//! let root = thread.allocate_preexisting(0, &[0; 8]);
//! ```
//!
//! Linking a new object into the heap:
//! ```
//! # use segstm::{config::Config, host::{Host, ObjectHeader, ObjectView}, runtime::Runtime};
//! # use std::sync::Arc;
//! # struct Cons;
//! # impl Host for Cons {
//! #     fn size_of(&self, _: ObjectHeader) -> usize { 16 }
//! #     fn trace(&self, _: ObjectView<'_>, visit: &mut dyn FnMut(usize)) { visit(8) }
//! # }
//! # let runtime = Runtime::new(Config::default(), Arc::new(Cons)).unwrap();
//! # let thread = runtime.register_thread();
//! # let root = thread.allocate_preexisting(0, &[0; 8]);
//! thread.rw(|tx| {
//!     let cell = tx.allocate(16, 0)?;
//!     tx.set_ref(root, 8, Some(cell))
//! });
//! let linked = thread.rw(|tx| tx.get_ref(root, 8));
//! assert!(linked.is_some());
//! ```
//!
//! # Features
//!
//! * Transactions behave as though they ran one after the other. Conflicts surface as an
//!   [`Error`](tx::Error) returned from barriers and commit; [`ThreadKey::rw`] retries.
//! * Young objects are bump allocated in a per segment nursery and moved into the old generation
//!   by minor collections. A stop the world mark and sweep collects the old generation.
//! * Large arrays use card marking, so writing one item backs up only its card.
//! * Finalizers, light destructors and weak references.
//! * One transaction at a time may be inevitable: it never aborts, and other commits wait for it.
//!
//! # Cargo features
//!
//! * `stats`: collect the counters returned by [`Runtime::stats`].
//!
//! [`ThreadKey::rw`]: thread_key::ThreadKey::rw
//! [`Runtime::stats`]: runtime::Runtime::stats

#![warn(macro_use_extern_crate)]
#![warn(missing_debug_implementations)]
#![warn(unused_lifetimes)]
#![cfg_attr(not(test), warn(unused_results))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

#[macro_use]
mod internal;

pub mod config;
pub mod error;
pub mod host;
pub mod object;
pub mod runtime;
mod rw;
pub mod stats;
pub mod thread_key;
pub mod tx;
pub mod vm;

pub use object::ObjRef;
pub use runtime::Runtime;
pub use rw::RwTx;
