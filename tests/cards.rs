mod common;

mod cards {
    use crate::common::{self, ID, INTS, ITEMS, LEN, REFS};
    use segstm::tx::Error;

    const LEN_ITEMS: usize = 1000;

    fn item(index: usize) -> usize {
        ITEMS + 8 * index
    }

    #[test]
    fn write_items() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let array = common::array(&key, INTS, LEN_ITEMS);
        key.rw(|tx| {
            for &i in &[0, 31, 32, 500, LEN_ITEMS - 1] {
                tx.write_card(array, i)?;
                tx.store(array, item(i), i as u64 + 1);
            }
            Ok(())
        });
        let (len, values) = key.rw(|tx| {
            tx.read(array)?;
            let values: Vec<u64> = [0, 1, 31, 32, 500, LEN_ITEMS - 1]
                .iter()
                .map(|&i| tx.load(array, item(i)))
                .collect();
            Ok((tx.load(array, LEN), values))
        });
        assert_eq!(len, LEN_ITEMS as u64);
        assert_eq!(values, vec![1, 0, 32, 33, 501, LEN_ITEMS as u64]);
    }

    #[test]
    fn abort_restores_cards() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let array = common::array(&key, INTS, LEN_ITEMS);
        key.rw(|tx| {
            tx.write_card(array, 10)?;
            tx.store(array, item(10), 10);
            Ok(())
        });

        let mut attempts = 0;
        key.rw(|tx| {
            attempts += 1;
            if attempts == 1 {
                tx.write_card(array, 10)?;
                tx.store(array, item(10), 99);
                tx.write_card(array, 900)?;
                tx.store(array, item(900), 99);
                return Err(Error::RETRY);
            }
            Ok(())
        });
        let values = key.rw(|tx| {
            tx.read(array)?;
            Ok((tx.load(array, item(10)), tx.load(array, item(900))))
        });
        assert_eq!(values, (10, 0));
    }

    #[test]
    fn card_write_then_whole_object_write() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let array = common::array(&key, INTS, LEN_ITEMS);

        let mut attempts = 0;
        key.rw(|tx| {
            attempts += 1;
            tx.write_card(array, 3)?;
            tx.store(array, item(3), 3);
            tx.write(array)?;
            tx.store(array, item(700), 700);
            if attempts == 1 {
                return Err(Error::RETRY);
            }
            Ok(())
        });
        let values = key.rw(|tx| {
            tx.read(array)?;
            Ok((tx.load(array, item(3)), tx.load(array, item(700))))
        });
        assert_eq!(values, (3, 700));
    }

    #[test]
    fn concurrent_writers_of_one_array() {
        use crossbeam_utils::thread;

        const THREAD_COUNT: usize = 4;
        const ITER_COUNT: u64 = 50;

        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let array = common::array(&key, INTS, LEN_ITEMS);
        thread::scope(|s| {
            for t in 0..THREAD_COUNT {
                let rt = &rt;
                s.spawn(move |_| {
                    let key = rt.register_thread();
                    let slot = item(t * 200);
                    for _ in 0..ITER_COUNT {
                        key.rw(|tx| {
                            tx.write_card(array, t * 200)?;
                            let n = tx.load(array, slot);
                            tx.store(array, slot, n + 1);
                            Ok(())
                        })
                    }
                });
            }
        })
        .unwrap();

        let values = key.rw(|tx| {
            tx.read(array)?;
            Ok((0..THREAD_COUNT)
                .map(|t| tx.load(array, item(t * 200)))
                .collect::<Vec<_>>())
        });
        assert_eq!(values, vec![ITER_COUNT; THREAD_COUNT]);
    }

    #[test]
    fn young_objects_in_marked_cards_survive() {
        let (rt, _) = common::runtime(common::config());
        let key = rt.register_thread();
        let array = common::array(&key, REFS, 200);
        key.rw(|tx| {
            for &i in &[5, 150] {
                let node = common::new_node(tx, i as u64)?;
                tx.write_card(array, i)?;
                tx.store_ref(array, item(i), Some(node));
            }
            Ok(())
        });
        let ids = key.rw(|tx| {
            tx.read(array)?;
            let mut ids = Vec::new();
            for &i in &[5, 150] {
                let node = tx.load_ref(array, item(i)).unwrap();
                ids.push(tx.get(node, ID)?);
            }
            Ok(ids)
        });
        assert_eq!(ids, vec![5, 150]);

        // and they stay alive through a major collection
        key.collect(1);
        let alive = key.rw(|tx| {
            tx.read(array)?;
            let node = tx.load_ref(array, item(150)).unwrap();
            tx.get(node, ID)
        });
        assert_eq!(alive, 150);
    }
}
