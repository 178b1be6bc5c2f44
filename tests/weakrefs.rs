mod common;

mod weakrefs {
    use crate::common::{self, ID, NEXT, OTHER, WEAK, WEAK_SIZE};
    use crossbeam_utils::thread;
    use segstm::ObjRef;
    use std::sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Barrier,
    };

    #[test]
    fn cleared_by_minor_collection() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 0);
        key.rw(|tx| {
            let target = common::new_node(tx, 5)?;
            let weak = tx.allocate_weakref(WEAK_SIZE, WEAK, target)?;
            tx.set_ref(root, OTHER, Some(weak))
        });
        let target = key.rw(|tx| {
            let weak = tx.get_ref(root, OTHER)?.unwrap();
            tx.weakref_get(weak)
        });
        assert_eq!(target, None);
    }

    #[test]
    fn young_target_survives_with_the_weakref() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 0);
        key.rw(|tx| {
            let target = common::new_node(tx, 5)?;
            tx.set_ref(root, NEXT, Some(target))?;
            let target = tx.get_ref(root, NEXT)?.unwrap();
            let weak = tx.allocate_weakref(WEAK_SIZE, WEAK, target)?;
            // the target is still readable through the weakref inside the transaction
            let through = tx.weakref_get(weak)?.unwrap();
            assert_eq!(tx.get(through, ID)?, 5);
            tx.set_ref(root, OTHER, Some(weak))
        });
        let (target, linked) = key.rw(|tx| {
            let weak = tx.get_ref(root, OTHER)?.unwrap();
            Ok((tx.weakref_get(weak)?, tx.get_ref(root, NEXT)?))
        });
        assert!(target.is_some());
        assert_eq!(target, linked);
    }

    #[test]
    fn cleared_by_major_collection() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 0);
        let strong = common::node(&key, 9);
        key.rw(|tx| {
            let target = common::new_node(tx, 5)?;
            tx.set_ref(root, NEXT, Some(target))?;
            let target = tx.get_ref(root, NEXT)?.unwrap();
            let weak = tx.allocate_weakref(WEAK_SIZE, WEAK, target)?;
            tx.set_ref(root, OTHER, Some(weak))?;
            let to_strong = tx.allocate_weakref(WEAK_SIZE, WEAK, strong)?;
            tx.set_ref(strong, OTHER, Some(to_strong))
        });
        let get = |slot_owner: ObjRef| {
            key.rw(|tx| {
                let weak = tx.get_ref(slot_owner, OTHER)?.unwrap();
                tx.weakref_get(weak)
            })
        };

        key.collect(1);
        assert!(get(root).is_some());
        assert_eq!(get(strong), Some(strong));

        key.rw(|tx| tx.set_ref(root, NEXT, None));
        key.collect(1);
        assert_eq!(get(root), None);
        assert_eq!(get(strong), Some(strong));
    }

    #[test]
    fn weakref_to_old_object() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 0);
        let old = common::node(&key, 1);
        let target = key.rw(|tx| {
            let weak = tx.allocate_weakref(WEAK_SIZE, WEAK, old)?;
            tx.set_ref(root, OTHER, Some(weak))?;
            tx.weakref_get(weak)
        });
        assert_eq!(target, Some(old));
    }

    #[test]
    fn cleared_slot_stays_cleared_after_a_writer_aborts() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 0);
        key.rw(|tx| {
            let target = common::new_node(tx, 5)?;
            tx.set_ref(root, NEXT, Some(target))?;
            let target = tx.get_ref(root, NEXT)?.unwrap();
            let weak = tx.allocate_weakref(WEAK_SIZE, WEAK, target)?;
            tx.set_ref(root, OTHER, Some(weak))
        });
        let weak = key.rw(|tx| Ok(tx.get_ref(root, OTHER)?.unwrap()));
        let written = Barrier::new(2);
        let collected = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|_| {
                let key = rt.register_thread();
                // backs up the weakref, target included
                let mut tx = key.start();
                tx.set(weak, ID, 77).unwrap();
                written.wait();
                while !collected.load(SeqCst) {
                    tx.check().unwrap();
                }
                tx.abort();
                assert_eq!(key.rw(|tx| tx.get(weak, ID)), 0);
                assert_eq!(key.rw(|tx| tx.weakref_get(weak)), None);
            });
            s.spawn(|_| {
                let key = rt.register_thread();
                written.wait();
                key.rw(|tx| tx.set_ref(root, NEXT, None));
                key.collect(1);
                collected.store(true, SeqCst);
            });
        })
        .unwrap();

        assert_eq!(key.rw(|tx| tx.weakref_get(weak)), None);
    }
}
