#![allow(dead_code)]

//! A small host shared by the integration tests.
//!
//! * `NODE`: `[header][id][next][other]`, both links traced.
//! * `INTS`: `[header][len][len x u64]`, card marked, nothing traced.
//! * `REFS`: like `INTS`, every item traced.
//! * `WEAK`: `[header][id][unused][weak slot]`, nothing traced.

use parking_lot::Mutex;
use segstm::{
    config::Config,
    host::{CardLayout, Host, ObjectHeader, ObjectView, TimingEvent, Marker},
    thread_key::ThreadKey,
    tx::Error,
    vm::PAGE_SIZE,
    ObjRef, Runtime, RwTx,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering::Relaxed},
    Arc,
};

pub const NODE: u32 = 1;
pub const INTS: u32 = 2;
pub const REFS: u32 = 3;
pub const WEAK: u32 = 4;

pub const NODE_SIZE: usize = 32;
pub const WEAK_SIZE: usize = 32;

pub const ID: usize = 8;
pub const NEXT: usize = 16;
pub const OTHER: usize = 24;
pub const LEN: usize = 8;
pub const ITEMS: usize = 16;

#[derive(Default)]
pub struct TestHost {
    pub destructed: AtomicUsize,
    pub finalized:  Mutex<Vec<u64>>,
    pub events:     Mutex<Vec<TimingEvent>>,
}

impl Host for TestHost {
    fn size_of(&self, header: ObjectHeader) -> usize {
        match header.tag {
            INTS | REFS => ITEMS + 8 * header.word as usize,
            WEAK => WEAK_SIZE,
            _ => NODE_SIZE,
        }
    }

    fn trace(&self, obj: ObjectView<'_>, visit: &mut dyn FnMut(usize)) {
        match obj.tag() {
            NODE => {
                visit(NEXT);
                visit(OTHER)
            }
            REFS => {
                let len = obj.read_u64(LEN) as usize;
                (0..len).for_each(|i| visit(ITEMS + 8 * i))
            }
            _ => {}
        }
    }

    fn card_layout(&self, header: ObjectHeader) -> Option<CardLayout> {
        match header.tag {
            INTS | REFS => Some(CardLayout {
                base_offset: ITEMS,
                item_size:   8,
            }),
            _ => None,
        }
    }

    fn destructor(&self, _: ObjectView<'_>) {
        self.destructed.fetch_add(1, Relaxed);
    }

    fn finalizer(&self, tx: &mut RwTx<'_>, obj: ObjRef) -> Result<(), Error> {
        let id = tx.get(obj, ID)?;
        self.finalized.lock().push(id);
        Ok(())
    }

    fn timing_event(&self, _: usize, event: TimingEvent, _: Option<Marker>) {
        self.events.lock().push(event)
    }
}

/// Small enough that collections happen in tests of modest size.
pub fn config() -> Config {
    Config {
        segments: 4,
        nursery_size: 16 * PAGE_SIZE,
        heap_size: 2048 * PAGE_SIZE,
        large_object_size: 4 * PAGE_SIZE,
        min_major_threshold: 64 * PAGE_SIZE,
        ..Config::default()
    }
}

pub fn runtime(config: Config) -> (Runtime, Arc<TestHost>) {
    let host = Arc::new(TestHost::default());
    let runtime = Runtime::new(config, host.clone()).unwrap();
    (runtime, host)
}

/// An always alive node.
pub fn node(key: &ThreadKey, id: u64) -> ObjRef {
    let mut payload = [0; NODE_SIZE - 8];
    payload[..8].copy_from_slice(&id.to_le_bytes());
    key.allocate_preexisting(NODE, &payload)
}

/// An always alive zeroed array of `len` items.
pub fn array(key: &ThreadKey, tag: u32, len: usize) -> ObjRef {
    let mut payload = vec![0; 8 + 8 * len];
    payload[..8].copy_from_slice(&(len as u64).to_le_bytes());
    key.allocate_preexisting(tag, &payload)
}

/// Allocates a young node. Every young reference held by the caller is invalidated.
pub fn new_node(tx: &mut RwTx<'_>, id: u64) -> Result<ObjRef, Error> {
    let node = tx.allocate(NODE_SIZE, NODE)?;
    tx.store(node, ID, id);
    Ok(node)
}

/// Ids along the `next` chain starting at `head`'s `next`.
pub fn chain(key: &ThreadKey, head: ObjRef) -> Vec<u64> {
    key.rw(|tx| {
        let mut ids = Vec::new();
        let mut cur = tx.get_ref(head, NEXT)?;
        while let Some(node) = cur {
            ids.push(tx.get(node, ID)?);
            cur = tx.get_ref(node, NEXT)?;
        }
        Ok(ids)
    })
}
