// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Concurrent transfer workloads: whatever interleaving a protocol
//! admits, committed transactions must be equivalent to some serial
//! order, so the total balance is conserved and every committed transfer
//! moved exactly what it read.

use claims::assert_ok;
use nfdb_txn::{
    mvocc::MvoccCoordinator, sgt::SgtCoordinator, tictoc::TictocCoordinator,
    twopl::TwoplCoordinator, TransactionSession,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const ROWS: u64 = 8;
const THREADS: u64 = 4;
const TRANSFERS: u64 = 200;
const INITIAL: u64 = 1_000;

/// Runs the workload through any protocol's sessions; retries aborted
/// transfers so every thread eventually moves its funds.
fn run_transfers<S, F>(make_session: F)
where
    S: TransactionSession<u64>,
    F: Fn() -> S + Sync,
{
    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let make_session = &make_session;
            scope.spawn(move || {
                let mut session = make_session();
                let mut rng = StdRng::seed_from_u64(thread);
                for _ in 0..TRANSFERS {
                    let from = rng.gen_range(0, ROWS);
                    let to = (from + rng.gen_range(1, ROWS)) % ROWS;
                    let amount = rng.gen_range(1, 11);
                    loop {
                        if try_transfer(&mut session, 0, from, to, amount) {
                            break;
                        }
                    }
                }
            });
        }
    });
}

fn try_transfer<S: TransactionSession<u64>>(
    session: &mut S,
    table: u32,
    from: u64,
    to: u64,
    amount: u64,
) -> bool {
    if session.begin().is_err() {
        return false;
    }
    let Ok(balance_from) = session.read(table, from) else {
        return false;
    };
    if balance_from < amount {
        session.abort();
        return true;
    }
    let Ok(balance_to) = session.read(table, to) else {
        return false;
    };
    if session.write(table, from, balance_from - amount).is_err() {
        return false;
    }
    if session.write(table, to, balance_to + amount).is_err() {
        return false;
    }
    session.commit().is_ok()
}

fn check_total<S: TransactionSession<u64>>(session: &mut S) {
    assert_ok!(session.begin());
    let mut total = 0;
    for row in 0..ROWS {
        total += session.read(0, row).expect("quiescent read cannot conflict");
    }
    assert_ok!(session.commit());
    assert_eq!(total, ROWS * INITIAL, "transfers must conserve the total");
}

#[test]
fn transfers_conserve_total_twopl() {
    let mut coordinator: TwoplCoordinator<u64> = TwoplCoordinator::new();
    let table = coordinator.register_table();
    for _ in 0..ROWS {
        coordinator.insert(table, INITIAL);
    }

    run_transfers(|| coordinator.session());
    check_total(&mut coordinator.session());
}

#[test]
fn transfers_conserve_total_sgt() {
    let mut coordinator: SgtCoordinator<u64> = SgtCoordinator::new();
    let table = coordinator.register_table();
    for _ in 0..ROWS {
        coordinator.insert(table, INITIAL);
    }

    run_transfers(|| coordinator.session());
    check_total(&mut coordinator.session());
}

#[test]
fn transfers_conserve_total_mvocc() {
    let mut coordinator: MvoccCoordinator<u64> = MvoccCoordinator::new();
    let table = coordinator.register_table();
    for _ in 0..ROWS {
        coordinator.insert(table, INITIAL);
    }

    run_transfers(|| coordinator.session());
    check_total(&mut coordinator.session());
}

#[test]
fn transfers_conserve_total_tictoc() {
    let mut coordinator: TictocCoordinator<u64> = TictocCoordinator::new();
    let table = coordinator.register_table();
    for _ in 0..ROWS {
        coordinator.insert(table, INITIAL);
    }

    run_transfers(|| coordinator.session());
    check_total(&mut coordinator.session());
}
