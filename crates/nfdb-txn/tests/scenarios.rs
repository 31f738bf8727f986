// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Literal conflict scenarios, one per protocol quirk: lock handoff and
//! wait-die kills, graph cycles, snapshot isolation, read-timestamp
//! extension.

use claims::{assert_err, assert_ok, assert_ok_eq};
use nfdb_txn::{
    mvocc::MvoccCoordinator, sgt::SgtCoordinator, tictoc::TictocCoordinator,
    twopl::TwoplCoordinator, TransactionSession, TxnError,
};
use std::time::Duration;
use test_case::test_case;

/// Long enough for a peer thread to reach its blocking point.
const SETTLE: Duration = Duration::from_millis(100);

#[test_case(10, 20; "ascending values")]
#[test_case(7, 3; "descending values")]
fn single_row_ww_twopl(first: u64, second: u64) {
    let mut coordinator: TwoplCoordinator<u64> = TwoplCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    let mut t1 = coordinator.session();
    assert_ok!(t1.begin());
    assert_ok!(t1.write(table, row, first));
    assert_ok!(t1.commit());

    let mut t2 = coordinator.session();
    assert_ok!(t2.begin());
    assert_ok!(t2.write(table, row, second));
    assert_ok!(t2.commit());

    let mut check = coordinator.session();
    assert_ok!(check.begin());
    assert_ok_eq!(check.read(table, row), second);
    assert_ok!(check.commit());
}

#[test]
fn single_row_ww_sgt_last_writer_wins() {
    let mut coordinator: SgtCoordinator<u64> = SgtCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    // No reads, so the two writers only form a ww edge; both commit.
    let mut t1 = coordinator.session();
    let mut t2 = coordinator.session();
    assert_ok!(t1.begin());
    assert_ok!(t2.begin());
    assert_ok!(t1.write(table, row, 10));
    assert_ok!(t2.write(table, row, 20));
    assert_ok!(t1.commit());
    assert_ok!(t2.commit());

    let mut check = coordinator.session();
    assert_ok!(check.begin());
    assert_ok_eq!(check.read(table, row), 20);
    assert_ok!(check.commit());
}

#[test]
fn lost_update_twopl() {
    let mut coordinator: TwoplCoordinator<u64> = TwoplCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    std::thread::scope(|scope| {
        // T1 is older; its write will block on T2's shared lock until the
        // younger T2 dies trying to upgrade.
        let mut t1 = coordinator.session();
        assert_ok!(t1.begin());
        assert_ok_eq!(t1.read(table, row), 0);

        let worker = scope.spawn(|| {
            let mut t2 = coordinator.session();
            assert_ok!(t2.begin());
            assert_ok_eq!(t2.read(table, row), 0);
            std::thread::sleep(2 * SETTLE);
            // By now the older T1 is waiting on our shared lock; the
            // younger side must die.
            assert_err!(t2.write(table, row, 1));
        });

        std::thread::sleep(SETTLE);
        assert_ok!(t1.write(table, row, 1));
        assert_ok!(t1.commit());
        worker.join().unwrap();
    });

    let mut check = coordinator.session();
    assert_ok!(check.begin());
    assert_ok_eq!(check.read(table, row), 1);
    assert_ok!(check.commit());
}

#[test]
fn lost_update_sgt() {
    let mut coordinator: SgtCoordinator<u64> = SgtCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    std::thread::scope(|scope| {
        let mut t2 = coordinator.session();

        let worker = scope.spawn(|| {
            let mut t1 = coordinator.session();
            assert_ok!(t1.begin());
            assert_ok_eq!(t1.read(table, row), 0);
            std::thread::sleep(SETTLE);
            assert_ok!(t1.write(table, row, 1));
            // Blocks on the rw predecessor (t2's read) until t2 resolves.
            assert_ok!(t1.commit());
        });

        assert_ok!(t2.begin());
        assert_ok_eq!(t2.read(table, row), 0);
        std::thread::sleep(3 * SETTLE);
        // t1 wrote after our read and is parked in commit; our own write
        // closes the cycle and must abort.
        assert_err!(t2.write(table, row, 1));
        worker.join().unwrap();
    });

    let mut check = coordinator.session();
    assert_ok!(check.begin());
    assert_ok_eq!(check.read(table, row), 1);
    assert_ok!(check.commit());
}

#[test]
fn lost_update_mvocc() {
    let mut coordinator: MvoccCoordinator<u64> = MvoccCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    let mut t1 = coordinator.session();
    let mut t2 = coordinator.session();
    assert_ok!(t1.begin());
    assert_ok!(t2.begin());
    assert_ok_eq!(t1.read(table, row), 0);
    assert_ok_eq!(t2.read(table, row), 0);
    assert_ok!(t1.write(table, row, 1));
    assert_ok!(t1.commit());
    // T2's window saw the row before T1's commit; the certifier rejects.
    assert_ok!(t2.write(table, row, 1));
    assert_err!(t2.commit());

    let mut check = coordinator.session();
    assert_ok!(check.begin());
    assert_ok_eq!(check.read(table, row), 1);
    assert_ok!(check.commit());
}

#[test]
fn lost_update_tictoc() {
    let mut coordinator: TictocCoordinator<u64> = TictocCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    let mut t1 = coordinator.session();
    let mut t2 = coordinator.session();
    assert_ok!(t1.begin());
    assert_ok!(t2.begin());
    assert_ok_eq!(t1.read(table, row), 0);
    assert_ok_eq!(t2.read(table, row), 0);
    assert_ok!(t1.write(table, row, 1));
    assert_ok!(t1.commit());
    // T2 read the version T1 just overwrote; validation fails.
    assert_ok!(t2.write(table, row, 1));
    assert_err!(t2.commit());
}

#[test]
fn write_cycle_sgt_aborts_exactly_one() {
    let mut coordinator: SgtCoordinator<u64> = SgtCoordinator::new();
    let table = coordinator.register_table();
    let row_a = coordinator.insert(table, 0);
    let row_b = coordinator.insert(table, 0);

    let mut t1 = coordinator.session();
    let mut t2 = coordinator.session();
    assert_ok!(t1.begin());
    assert_ok!(t2.begin());
    assert_ok_eq!(t1.read(table, row_a), 0);
    assert_ok_eq!(t2.read(table, row_b), 0);
    assert_ok!(t1.write(table, row_b, 1));
    // t2's write over row_a closes the rw/rw cycle.
    assert_err!(t2.write(table, row_a, 1));
    assert_ok!(t1.commit());
}

#[test]
fn wait_die_senior_waits_for_handoff() {
    let mut coordinator: TwoplCoordinator<u64> = TwoplCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    std::thread::scope(|scope| {
        // Begin order fixes seniority: t_old first.
        let mut t_old = coordinator.session();
        assert_ok!(t_old.begin());

        let mut t_young = coordinator.session();
        assert_ok!(t_young.begin());
        assert_ok!(t_young.write(table, row, 7));

        let worker = scope.spawn(move || {
            // Senior transaction: waits for the young lock holder, then
            // acquires.
            assert_ok!(t_old.write(table, row, 9));
            assert_ok!(t_old.commit());
        });

        std::thread::sleep(SETTLE);
        assert_ok!(t_young.commit());
        worker.join().unwrap();
    });

    let mut check = coordinator.session();
    assert_ok!(check.begin());
    assert_ok_eq!(check.read(table, row), 9, "senior writes after the handoff");
    assert_ok!(check.commit());
}

#[test]
fn wait_die_junior_dies_immediately() {
    let mut coordinator: TwoplCoordinator<u64> = TwoplCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    let mut t_old = coordinator.session();
    assert_ok!(t_old.begin());
    assert_ok!(t_old.write(table, row, 9));

    let mut t_young = coordinator.session();
    assert_ok!(t_young.begin());
    assert_eq!(t_young.write(table, row, 7), Err(TxnError::Conflict));

    assert_ok!(t_old.commit());
    let mut check = coordinator.session();
    assert_ok!(check.begin());
    assert_ok_eq!(check.read(table, row), 9);
    assert_ok!(check.commit());
}

#[test]
fn mvcc_snapshot_read() {
    let mut coordinator: MvoccCoordinator<u64> = MvoccCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 100);

    let mut reader = coordinator.session();
    assert_ok!(reader.begin());

    let mut writer = coordinator.session();
    assert_ok!(writer.begin());
    assert_ok!(writer.write(table, row, 200));
    assert_ok!(writer.commit());

    // The reader's snapshot predates the writer's commit.
    assert_ok_eq!(reader.read(table, row), 100);
    // The certifier would reject this stale read at commit; a snapshot
    // reader that only wanted to observe ends with abort.
    reader.abort();

    let mut late = coordinator.session();
    assert_ok!(late.begin());
    assert_ok_eq!(late.read(table, row), 200);
    assert_ok!(late.commit());
}

#[test]
fn mvocc_scan_reads_snapshot() {
    let mut coordinator: MvoccCoordinator<u64> = MvoccCoordinator::new();
    let table = coordinator.register_table();
    for i in 0..8u64 {
        coordinator.insert(table, i);
    }

    let mut reader = coordinator.session();
    assert_ok!(reader.begin());

    let mut writer = coordinator.session();
    assert_ok!(writer.begin());
    assert_ok!(writer.write(table, 3, 999));
    assert_ok!(writer.commit());

    let mut seen = Vec::new();
    assert_ok!(reader.scan(table, 0, 7, |row, value| seen.push((row, value))));
    assert_eq!(seen.len(), 8);
    assert_eq!(seen[3], (3, 3), "snapshot predates the overwrite");

    // Out-of-range rows surface as a typed conflict that aborts the
    // transaction; nothing is printed.
    assert_eq!(
        reader.scan(table, 0, 99, |_, _| {}),
        Err(TxnError::Conflict)
    );
    // Already aborted by the failed scan; this is a no-op.
    reader.abort();
}

#[test]
fn tictoc_commit_extends_instead_of_rereading() {
    let mut coordinator: TictocCoordinator<u64> = TictocCoordinator::new();
    let table = coordinator.register_table();
    let row_a = coordinator.insert(table, 1);
    let row_b = coordinator.insert(table, 2);

    // Bump row_b's timestamp with an unrelated committed write.
    let mut bump = coordinator.session();
    assert_ok!(bump.begin());
    assert_ok!(bump.write(table, row_b, 20));
    assert_ok!(bump.commit());

    let mut reader = coordinator.session();
    assert_ok!(reader.begin());
    let a_before = coordinator.row_timestamp(table, row_a);
    assert_ok_eq!(reader.read(table, row_a), 1);

    let mut writer = coordinator.session();
    assert_ok!(writer.begin());
    assert_ok!(writer.write(table, row_b, 30));
    assert_ok!(writer.commit());

    // Reader writes row_b too, pushing its commit timestamp past row_a's
    // read horizon; commit succeeds by extending row_a's delta in place.
    assert_ok!(reader.write(table, row_b, 40));
    assert_ok!(reader.commit());

    let a_after = coordinator.row_timestamp(table, row_a);
    assert_eq!(a_after.wts(), a_before.wts(), "data untouched");
    assert!(a_after.delta() > a_before.delta(), "horizon extended in place");
}

#[test]
fn abort_is_idempotent_everywhere() {
    let mut twopl: TwoplCoordinator<u64> = TwoplCoordinator::new();
    let table = twopl.register_table();
    let row = twopl.insert(table, 5);
    let mut session = twopl.session();
    session.abort();
    assert_ok!(session.begin());
    assert_ok!(session.write(table, row, 6));
    session.abort();
    session.abort();
    assert_ok!(session.begin());
    assert_ok_eq!(session.read(table, row), 5, "undo restored the value");
    assert_ok!(session.commit());

    let mut sgt: SgtCoordinator<u64> = SgtCoordinator::new();
    let table = sgt.register_table();
    let row = sgt.insert(table, 5);
    let mut session = sgt.session();
    session.abort();
    assert_ok!(session.begin());
    assert_ok!(session.write(table, row, 6));
    session.abort();
    session.abort();
    assert_ok!(session.begin());
    assert_ok_eq!(session.read(table, row), 5);
    assert_ok!(session.commit());

    let mut mvocc: MvoccCoordinator<u64> = MvoccCoordinator::new();
    let table = mvocc.register_table();
    let row = mvocc.insert(table, 5);
    let mut session = mvocc.session();
    session.abort();
    assert_ok!(session.begin());
    assert_ok!(session.write(table, row, 6));
    session.abort();
    session.abort();
    assert_ok!(session.begin());
    assert_ok_eq!(session.read(table, row), 5);
    assert_ok!(session.commit());

    let mut tictoc: TictocCoordinator<u64> = TictocCoordinator::new();
    let table = tictoc.register_table();
    let row = tictoc.insert(table, 5);
    let mut session = tictoc.session();
    session.abort();
    assert_ok!(session.begin());
    assert_ok!(session.write(table, row, 6));
    session.abort();
    session.abort();
    assert_ok!(session.begin());
    assert_ok_eq!(session.read(table, row), 5);
    assert_ok!(session.commit());
}

#[test]
fn cascading_abort_reaches_dirty_reader() {
    let mut coordinator: SgtCoordinator<u64> = SgtCoordinator::new();
    let table = coordinator.register_table();
    let row = coordinator.insert(table, 0);

    let mut writer = coordinator.session();
    let mut reader = coordinator.session();
    assert_ok!(writer.begin());
    assert_ok!(reader.begin());

    assert_ok!(writer.write(table, row, 42));
    // Dirty read of the in-place write.
    assert_ok_eq!(reader.read(table, row), 42);

    writer.abort();
    // The reader consumed a doomed value; its commit must cascade-abort.
    assert_eq!(reader.commit(), Err(TxnError::CascadingAbort(1)));

    let mut check = coordinator.session();
    assert_ok!(check.begin());
    assert_ok_eq!(check.read(table, row), 0, "writer's undo restored the row");
    assert_ok!(check.commit());
}
