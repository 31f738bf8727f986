// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Randomized conformance check: with no concurrency, every protocol must
//! behave exactly like a plain map: reads observe the latest write
//! (own-transaction writes included) and nothing ever aborts.

use claims::{assert_ok, assert_ok_eq};
use nfdb_txn::{
    mvocc::MvoccCoordinator, sgt::SgtCoordinator, tictoc::TictocCoordinator,
    twopl::TwoplCoordinator, TransactionSession,
};
use proptest::prelude::*;
use proptest_derive::Arbitrary;

const ROWS: u64 = 6;

#[derive(Clone, Copy, Debug, Arbitrary)]
enum Op {
    Read(#[proptest(strategy = "0..ROWS")] u64),
    Write(#[proptest(strategy = "0..ROWS")] u64, u64),
}

fn txns_strategy() -> impl Strategy<Value = Vec<Vec<Op>>> {
    prop::collection::vec(prop::collection::vec(any::<Op>(), 1..8), 1..12)
}

fn check_sequential<S: TransactionSession<u64>>(session: &mut S, txns: &[Vec<Op>]) {
    let mut model: Vec<u64> = (0..ROWS).collect();
    for txn in txns {
        let mut pending = model.clone();
        assert_ok!(session.begin());
        for op in txn {
            match *op {
                Op::Read(row) => {
                    assert_ok_eq!(session.read(0, row), pending[row as usize]);
                },
                Op::Write(row, value) => {
                    assert_ok!(session.write(0, row, value));
                    pending[row as usize] = value;
                },
            }
        }
        assert_ok!(session.commit());
        model = pending;
    }

    assert_ok!(session.begin());
    for row in 0..ROWS {
        assert_ok_eq!(session.read(0, row), model[row as usize]);
    }
    assert_ok!(session.commit());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sequential_matches_model_twopl(txns in txns_strategy()) {
        let mut coordinator: TwoplCoordinator<u64> = TwoplCoordinator::new();
        let table = coordinator.register_table();
        for i in 0..ROWS {
            coordinator.insert(table, i);
        }
        check_sequential(&mut coordinator.session(), &txns);
    }

    #[test]
    fn sequential_matches_model_sgt(txns in txns_strategy()) {
        let mut coordinator: SgtCoordinator<u64> = SgtCoordinator::new();
        let table = coordinator.register_table();
        for i in 0..ROWS {
            coordinator.insert(table, i);
        }
        check_sequential(&mut coordinator.session(), &txns);
    }

    #[test]
    fn sequential_matches_model_mvocc(txns in txns_strategy()) {
        let mut coordinator: MvoccCoordinator<u64> = MvoccCoordinator::new();
        let table = coordinator.register_table();
        for i in 0..ROWS {
            coordinator.insert(table, i);
        }
        check_sequential(&mut coordinator.session(), &txns);
    }

    #[test]
    fn sequential_matches_model_tictoc(txns in txns_strategy()) {
        let mut coordinator: TictocCoordinator<u64> = TictocCoordinator::new();
        let table = coordinator.register_table();
        for i in 0..ROWS {
            coordinator.insert(table, i);
        }
        check_sequential(&mut coordinator.session(), &txns);
    }
}
