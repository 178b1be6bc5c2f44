mod common;

mod basic {
    use crate::common::{self, ID, NEXT, NODE, NODE_SIZE};
    use crossbeam_utils::thread;
    use segstm::{error::ShutdownError, host::TimingEvent, tx::Error};

    #[test]
    fn preexisting_payload() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let x = common::node(&key, 7);
        assert_eq!(key.rw(|tx| tx.get(x, ID)), 7);
        assert_eq!(key.rw(|tx| tx.get_ref(x, NEXT)), None);
    }

    #[test]
    fn read_own_writes() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let x = common::node(&key, 0);
        let seen = key.rw(|tx| {
            tx.set(x, ID, 42)?;
            let first = tx.get(x, ID)?;
            tx.set(x, ID, first + 1)?;
            tx.get(x, ID)
        });
        assert_eq!(seen, 43);
        assert_eq!(key.rw(|tx| tx.get(x, ID)), 43);
    }

    #[test]
    fn abort_leaves_no_trace() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 1);

        let mut attempts = 0;
        key.rw(|tx| {
            attempts += 1;
            if attempts == 1 {
                tx.set(root, ID, 100)?;
                let young = common::new_node(tx, 5)?;
                tx.set_ref(root, NEXT, Some(young))?;
                return Err(Error::RETRY);
            }
            Ok(())
        });
        assert_eq!(attempts, 2);
        assert_eq!(key.last_retry_count(), 1);
        assert_eq!(key.rw(|tx| tx.get(root, ID)), 1);
        assert_eq!(common::chain(&key, root), vec![]);
    }

    #[test]
    fn explicit_abort() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let x = common::node(&key, 3);

        let mut tx = key.start();
        tx.set(x, ID, 30).unwrap();
        tx.abort();

        let mut tx = key.start();
        tx.set(x, ID, 31).unwrap();
        drop(tx);

        assert_eq!(key.rw(|tx| tx.get(x, ID)), 3);
    }

    #[test]
    fn linked_list_survives_commit() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let root = common::node(&key, 0);

        key.rw(|tx| {
            for id in 1..=20 {
                let node = common::new_node(tx, id)?;
                let next = tx.get_ref(root, NEXT)?;
                tx.store_ref(node, NEXT, next);
                tx.set_ref(root, NEXT, Some(node))?;
            }
            Ok(())
        });
        assert_eq!(common::chain(&key, root), (1..=20).rev().collect::<Vec<_>>());
    }

    #[test]
    fn bytes() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let x = common::node(&key, 0);
        key.rw(|tx| {
            tx.write(x)?;
            tx.store_bytes(x, ID, b"segstm!!");
            Ok(())
        });
        let mut buf = [0; 8];
        key.rw(|tx| {
            tx.read(x)?;
            tx.load_bytes(x, ID, &mut buf);
            Ok(())
        });
        assert_eq!(&buf, b"segstm!!");
    }

    #[test]
    fn concurrent_increments() {
        const THREAD_COUNT: usize = 8;
        const ITER_COUNT: u64 = 200;

        let (rt, _) = common::runtime(common::config());
        let counter = common::node(&rt.register_thread(), 0);
        thread::scope(|s| {
            for _ in 0..THREAD_COUNT {
                s.spawn(|_| {
                    let key = rt.register_thread();
                    for _ in 0..ITER_COUNT {
                        key.rw(|tx| {
                            let n = tx.get(counter, ID)?;
                            tx.set(counter, ID, n + 1)
                        })
                    }
                });
            }
        })
        .unwrap();

        let key = rt.register_thread();
        assert_eq!(
            key.rw(|tx| tx.get(counter, ID)),
            THREAD_COUNT as u64 * ITER_COUNT
        );
    }

    #[test]
    fn transfers_preserve_total() {
        const THREAD_COUNT: usize = 4;
        const ITER_COUNT: u64 = 300;
        const ACCOUNTS: u64 = 8;

        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let accounts: Vec<_> = (0..ACCOUNTS).map(|_| common::node(&key, 100)).collect();
        thread::scope(|s| {
            for t in 0..THREAD_COUNT as u64 {
                let accounts = &accounts;
                let rt = &rt;
                s.spawn(move |_| {
                    let key = rt.register_thread();
                    for i in 0..ITER_COUNT {
                        let from = accounts[((t + i) % ACCOUNTS) as usize];
                        let to = accounts[((t * 3 + i * 5 + 1) % ACCOUNTS) as usize];
                        key.rw(|tx| {
                            let a = tx.get(from, ID)?;
                            let b = tx.get(to, ID)?;
                            if from != to && a > 0 {
                                tx.set(from, ID, a - 1)?;
                                tx.set(to, ID, b + 1)?;
                            }
                            Ok(())
                        })
                    }
                });
            }
        })
        .unwrap();

        let total = key.rw(|tx| {
            let mut total = 0;
            for &account in &accounts {
                total += tx.get(account, ID)?;
            }
            Ok(total)
        });
        assert_eq!(total, 100 * ACCOUNTS);
    }

    #[test]
    fn more_threads_than_segments() {
        let mut config = common::config();
        config.segments = 2;
        let (rt, _) = common::runtime(config);
        let counter = common::node(&rt.register_thread(), 0);
        thread::scope(|s| {
            for _ in 0..6 {
                s.spawn(|_| {
                    let key = rt.register_thread();
                    for _ in 0..50 {
                        key.rw(|tx| {
                            let n = tx.get(counter, ID)?;
                            tx.set(counter, ID, n + 1)
                        })
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(rt.register_thread().rw(|tx| tx.get(counter, ID)), 300);
    }

    #[test]
    fn shadow_stack() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let x = common::node(&key, 0);
        assert_eq!(key.peek_root(), None);
        key.push_root(x);
        assert_eq!(key.peek_root(), Some(x));

        // an aborted transaction restores the stack it started with
        let mut attempts = 0;
        key.rw(|tx| {
            attempts += 1;
            if attempts == 1 {
                let _ = tx.pop_root();
                let young = tx.allocate(NODE_SIZE, NODE)?;
                tx.push_root(young);
                return Err(Error::RETRY);
            }
            Ok(())
        });
        assert_eq!(key.pop_root(), Some(x));
        assert_eq!(key.pop_root(), None);
    }

    #[test]
    fn thread_local_root() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        key.rw(|tx| {
            let node = common::new_node(tx, 9)?;
            tx.set_thread_local(Some(node));
            Ok(())
        });
        let id = key.rw(|tx| match tx.thread_local() {
            Some(node) => tx.get(node, ID),
            None => Ok(0),
        });
        assert_eq!(id, 9);
    }

    #[test]
    fn timing_events() {
        let (rt, host) = common::runtime(common::config());
        let key = rt.register_thread();
        let x = common::node(&key, 0);
        host.events.lock().clear();

        key.rw(|tx| tx.set(x, ID, 1));
        {
            let events = host.events.lock();
            assert_eq!(events.first(), Some(&TimingEvent::TransactionStart));
            assert_eq!(events.last(), Some(&TimingEvent::TransactionCommit));
            assert!(events.contains(&TimingEvent::MinorGcDone));
        }

        host.events.lock().clear();
        key.start().abort();
        assert_eq!(
            *host.events.lock(),
            vec![TimingEvent::TransactionStart, TimingEvent::TransactionAbort]
        );
    }

    #[test]
    fn shutdown() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let x = common::node(&key, 0);
        key.rw(|tx| tx.set(x, ID, 1));
        assert_eq!(rt.shutdown(), Err(ShutdownError::ThreadsRegistered(1)));

        let (rt, _) = common::runtime(common::config());
        drop(rt.register_thread());
        assert_eq!(rt.shutdown(), Ok(()));
    }

    #[test]
    fn invalid_config() {
        let mut config = common::config();
        config.segments = 0;
        let host = std::sync::Arc::new(common::TestHost::default());
        assert!(segstm::Runtime::new(config, host).is_err());
    }
}
