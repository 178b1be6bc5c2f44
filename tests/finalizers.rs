mod common;

mod finalizers {
    use crate::common::{self, ID, NEXT, NODE, NODE_SIZE};
    use std::sync::atomic::Ordering::Relaxed;

    #[test]
    fn unreachable_object_is_finalized_once() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        key.rw(|tx| {
            let obj = tx.allocate_with_finalizer(NODE_SIZE, NODE)?;
            tx.store(obj, ID, 1);
            Ok(())
        });

        key.collect(1);
        assert!(host.finalized.lock().is_empty(), "collect does not run finalizers");
        key.run_finalizers();
        assert_eq!(*host.finalized.lock(), vec![1]);

        key.collect(1);
        key.run_finalizers();
        assert_eq!(*host.finalized.lock(), vec![1]);
    }

    #[test]
    fn reachable_object_is_not_finalized() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 0);
        key.rw(|tx| {
            let obj = tx.allocate_with_finalizer(NODE_SIZE, NODE)?;
            tx.store(obj, ID, 1);
            tx.set_ref(root, NEXT, Some(obj))
        });

        key.collect(1);
        key.run_finalizers();
        assert!(host.finalized.lock().is_empty());

        key.rw(|tx| tx.set_ref(root, NEXT, None));
        key.collect(1);
        key.run_finalizers();
        assert_eq!(*host.finalized.lock(), vec![1]);
    }

    #[test]
    fn referenced_finalizable_objects_go_last() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        // a -> b -> c, all finalizable and unreachable
        key.rw(|tx| {
            let c = tx.allocate_with_finalizer(NODE_SIZE, NODE)?;
            tx.store(c, ID, 3);
            tx.push_root(c);
            let b = tx.allocate_with_finalizer(NODE_SIZE, NODE)?;
            tx.store(b, ID, 2);
            let c = tx.pop_root().unwrap();
            tx.store_ref(b, NEXT, Some(c));
            tx.push_root(b);
            let a = tx.allocate_with_finalizer(NODE_SIZE, NODE)?;
            tx.store(a, ID, 1);
            let b = tx.pop_root().unwrap();
            tx.store_ref(a, NEXT, Some(b));
            Ok(())
        });

        for expected in &[vec![1], vec![1, 2], vec![1, 2, 3]] {
            key.collect(1);
            key.run_finalizers();
            assert_eq!(&*host.finalized.lock(), expected);
        }
    }

    #[test]
    fn finalizer_keeps_referenced_objects_alive() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        key.rw(|tx| {
            let plain = common::new_node(tx, 20)?;
            tx.push_root(plain);
            let obj = tx.allocate_with_finalizer(NODE_SIZE, NODE)?;
            let plain = tx.pop_root().unwrap();
            tx.store(obj, ID, 10);
            tx.store_ref(obj, NEXT, Some(plain));
            Ok(())
        });
        key.collect(1);
        let usage = rt.heap_usage();
        // both survive until the finalizer ran
        assert_eq!(usage.bytes_in_use, 2 * NODE_SIZE);

        key.run_finalizers();
        assert_eq!(*host.finalized.lock(), vec![10]);
        key.collect(1);
        assert_eq!(rt.heap_usage().bytes_in_use, 0);
    }

    #[test]
    fn cycle_of_finalizable_objects() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        key.rw(|tx| {
            let a = tx.allocate_with_finalizer(NODE_SIZE, NODE)?;
            tx.store(a, ID, 1);
            tx.push_root(a);
            let b = tx.allocate_with_finalizer(NODE_SIZE, NODE)?;
            let a = tx.pop_root().unwrap();
            tx.store(b, ID, 2);
            tx.store_ref(a, NEXT, Some(b));
            tx.store_ref(b, NEXT, Some(a));
            Ok(())
        });
        // one member of the cycle per collection, the other stays reachable from it
        key.collect(1);
        key.run_finalizers();
        assert_eq!(host.finalized.lock().len(), 1);
        key.collect(1);
        key.run_finalizers();
        let mut finalized = host.finalized.lock().clone();
        finalized.sort_unstable();
        assert_eq!(finalized, vec![1, 2]);
    }

    #[test]
    fn aborted_finalizable_objects_are_forgotten() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        let mut tx = key.start();
        let obj = tx.allocate_with_finalizer(NODE_SIZE, NODE).unwrap();
        tx.store(obj, ID, 1);
        tx.collect(0).unwrap();
        tx.abort();

        key.collect(1);
        key.run_finalizers();
        assert!(host.finalized.lock().is_empty());
        assert_eq!(rt.heap_usage().bytes_in_use, 0);
    }

    #[test]
    fn destructors() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 0);

        // dies young
        key.rw(|tx| tx.allocate_with_destructor(NODE_SIZE, NODE).map(drop));
        assert_eq!(host.destructed.load(Relaxed), 1);

        // aborted
        let mut tx = key.start();
        let _ = tx.allocate_with_destructor(NODE_SIZE, NODE).unwrap();
        tx.abort();
        assert_eq!(host.destructed.load(Relaxed), 2);

        // dies old
        key.rw(|tx| {
            let obj = tx.allocate_with_destructor(NODE_SIZE, NODE)?;
            tx.set_ref(root, NEXT, Some(obj))
        });
        key.collect(1);
        assert_eq!(host.destructed.load(Relaxed), 2);
        key.rw(|tx| tx.set_ref(root, NEXT, None));
        key.collect(1);
        assert_eq!(host.destructed.load(Relaxed), 3);
    }

    #[test]
    fn aborted_overflow_object_destructor() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        let mut tx = key.start();
        let obj = tx.allocate_with_destructor(NODE_SIZE, NODE).unwrap();
        tx.push_root(obj);
        tx.collect(0).unwrap();
        assert_eq!(host.destructed.load(Relaxed), 0);
        tx.abort();
        assert_eq!(host.destructed.load(Relaxed), 1);
        assert_eq!(key.peek_root(), None);
    }
}
