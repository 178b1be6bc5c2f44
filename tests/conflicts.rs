mod common;

// Two thread keys on one OS thread give a deterministic interleaving of two transactions.
mod conflicts {
    use crate::common::{self, ID};
    use segstm::tx::{AbortReason, ConflictCategory};

    #[test]
    fn read_then_foreign_commit() {
        let (rt, _) = common::runtime(common::config());
        let a = rt.register_thread();
        let b = rt.register_thread();
        let x = common::node(&a, 1);
        let y = common::node(&a, 2);

        let mut ta = a.start();
        assert_eq!(ta.get(x, ID), Ok(1));

        let mut tb = b.start();
        tb.set(x, ID, 10).unwrap();
        tb.commit().unwrap();

        let err = ta.write(y).unwrap_err();
        assert_eq!(err.reason(), AbortReason::ValidateInflight);
        assert_eq!(err.reason().category(), ConflictCategory::WriteRead);
        // every later barrier reports the same abort
        assert_eq!(ta.read(y).unwrap_err(), err);
        drop(ta);

        assert_eq!(a.rw(|tx| tx.get(x, ID)), 10);
        assert_eq!(a.rw(|tx| tx.get(y, ID)), 2);
    }

    #[test]
    fn write_write() {
        let (rt, _) = common::runtime(common::config());
        let a = rt.register_thread();
        let b = rt.register_thread();
        let x = common::node(&a, 1);
        let y = common::node(&a, 2);

        let mut ta = a.start();
        ta.set(x, ID, 5).unwrap();

        let mut tb = b.start();
        tb.set(x, ID, 6).unwrap();
        tb.commit().unwrap();

        let err = ta.get(y, ID).unwrap_err();
        assert_eq!(err.reason(), AbortReason::WriteWrite);
        assert_eq!(ta.commit().unwrap_err(), err);

        assert_eq!(a.rw(|tx| tx.get(x, ID)), 6);
    }

    #[test]
    fn validate_at_commit() {
        let (rt, _) = common::runtime(common::config());
        let a = rt.register_thread();
        let b = rt.register_thread();
        let x = common::node(&a, 1);
        let y = common::node(&a, 2);

        let mut ta = a.start();
        let seen = ta.get(x, ID).unwrap();
        ta.set(y, ID, seen + 100).unwrap();

        let mut tb = b.start();
        tb.set(x, ID, 50).unwrap();
        tb.commit().unwrap();

        assert_eq!(
            ta.commit().unwrap_err().reason(),
            AbortReason::ValidateCommit
        );
        assert_eq!(a.rw(|tx| tx.get(y, ID)), 2);
    }

    #[test]
    fn disjoint_writes_commit() {
        let (rt, _) = common::runtime(common::config());
        let a = rt.register_thread();
        let b = rt.register_thread();
        let x = common::node(&a, 1);
        let y = common::node(&a, 2);

        let mut ta = a.start();
        ta.set(x, ID, 11).unwrap();

        let mut tb = b.start();
        tb.set(y, ID, 22).unwrap();
        tb.commit().unwrap();

        // y was committed after `ta` started, and its new value is imported without an abort
        assert_eq!(ta.get(y, ID), Ok(22));
        ta.commit().unwrap();

        assert_eq!(a.rw(|tx| Ok((tx.get(x, ID)?, tx.get(y, ID)?))), (11, 22));
    }

    #[test]
    fn snapshot_is_stable_for_unread_objects() {
        let (rt, _) = common::runtime(common::config());
        let a = rt.register_thread();
        let b = rt.register_thread();
        let x = common::node(&a, 1);

        let ta = a.start();
        let mut tb = b.start();
        tb.set(x, ID, 2).unwrap();
        tb.commit().unwrap();

        let mut tb = b.start();
        assert_eq!(tb.get(x, ID), Ok(2));
        tb.commit().unwrap();
        ta.commit().unwrap();
    }

    #[test]
    fn read_only_commit_after_foreign_write() {
        let (rt, _) = common::runtime(common::config());
        let a = rt.register_thread();
        let b = rt.register_thread();
        let x = common::node(&a, 1);

        let mut ta = a.start();
        assert_eq!(ta.get(x, ID), Ok(1));
        let mut tb = b.start();
        tb.set(x, ID, 2).unwrap();
        tb.commit().unwrap();

        // a transaction that wrote nothing serializes before `tb`
        ta.commit().unwrap();
    }
}
