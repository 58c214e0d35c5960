mod common;

use std::sync::Arc;
use std::thread;

use rust_decimal::Decimal;

use common::{reopen, service_with_defaults, service_with_settings};
use reward_ledger::balance::EarnOutcome;
use reward_ledger::errors::RewardError;
use reward_ledger::ledger::TxnType;
use reward_ledger::settings::RewardSettings;

const CUSTOMER: u64 = 4001;

#[test]
fn test_reserve_then_commit() {
    let env = service_with_defaults();
    let svc = &env.service;

    svc.adjust(CUSTOMER, 1000, "initial grant").unwrap();

    svc.reserve(CUSTOMER, 500, "order-1").unwrap();
    let summary = svc.balance_of(CUSTOMER);
    assert_eq!(summary.balance, 1000);
    assert_eq!(summary.reserved, 500);
    assert_eq!(summary.available, 500);

    let txn = svc.commit_redeem(CUSTOMER, "order-1").unwrap();
    assert_eq!(txn.txn_type, TxnType::Redeemed);
    assert_eq!(txn.points, -500);

    let summary = svc.balance_of(CUSTOMER);
    assert_eq!(summary.balance, 500);
    assert_eq!(summary.reserved, 0);
    assert_eq!(summary.lifetime_redeemed, 500);

    let redeemed: Vec<_> = svc
        .transactions_of(CUSTOMER)
        .into_iter()
        .filter(|t| t.txn_type == TxnType::Redeemed)
        .collect();
    assert_eq!(redeemed.len(), 1);
}

#[test]
fn test_reserve_then_release() {
    let env = service_with_defaults();
    let svc = &env.service;

    svc.adjust(CUSTOMER, 1000, "initial grant").unwrap();
    svc.reserve(CUSTOMER, 500, "order-2").unwrap();

    let txn = svc.release(CUSTOMER, "order-2").unwrap().unwrap();
    assert_eq!(txn.txn_type, TxnType::Released);
    // A release moves no balance; the row documents the hold going away.
    assert_eq!(txn.points, 0);

    let summary = svc.balance_of(CUSTOMER);
    assert_eq!(summary.balance, 1000);
    assert_eq!(summary.reserved, 0);

    // Releasing again is a no-op, not an error.
    assert!(svc.release(CUSTOMER, "order-2").unwrap().is_none());
}

#[test]
fn test_earn_is_idempotent_per_order() {
    let env = service_with_defaults();
    let svc = &env.service;

    // earn_rate 1.0: a 100.00 order earns 100 points
    let first = svc.earn(CUSTOMER, 10_000, "order-3").unwrap();
    let first_txn = match first {
        EarnOutcome::Credited(t) => t,
        other => panic!("expected Credited, got {:?}", other),
    };
    assert_eq!(first_txn.points, 100);

    let second = svc.earn(CUSTOMER, 10_000, "order-3").unwrap();
    match second {
        EarnOutcome::AlreadyCredited(t) => assert_eq!(t.id, first_txn.id),
        other => panic!("expected AlreadyCredited, got {:?}", other),
    }

    let earned: Vec<_> = svc
        .transactions_of(CUSTOMER)
        .into_iter()
        .filter(|t| t.txn_type == TxnType::Earned)
        .collect();
    assert_eq!(earned.len(), 1);
    assert_eq!(svc.balance_of(CUSTOMER).balance, 100);
}

#[test]
fn test_earn_disabled() {
    let settings = RewardSettings { enabled: false, ..Default::default() };
    let env = service_with_settings(settings);

    let outcome = env.service.earn(CUSTOMER, 10_000, "order-4").unwrap();
    assert!(matches!(outcome, EarnOutcome::Disabled));
    assert_eq!(env.service.balance_of(CUSTOMER).balance, 0);
    assert!(env.service.transactions_of(CUSTOMER).is_empty());
}

#[test]
fn test_reserve_insufficient_available() {
    let env = service_with_defaults();
    let svc = &env.service;

    svc.adjust(CUSTOMER, 300, "initial grant").unwrap();
    let err = svc.reserve(CUSTOMER, 400, "order-5").unwrap_err();
    match err {
        RewardError::InsufficientAvailable { available, requested } => {
            assert_eq!(available, 300);
            assert_eq!(requested, 400);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(svc.balance_of(CUSTOMER).reserved, 0);
}

#[test]
fn test_reserve_is_idempotent_per_order() {
    let env = service_with_defaults();
    let svc = &env.service;

    svc.adjust(CUSTOMER, 1000, "initial grant").unwrap();
    svc.reserve(CUSTOMER, 500, "order-6").unwrap();
    // Redelivered checkout call: no second hold
    svc.reserve(CUSTOMER, 500, "order-6").unwrap();
    assert_eq!(svc.balance_of(CUSTOMER).reserved, 500);
}

#[test]
fn test_reserve_enforces_settings_bounds() {
    let settings = RewardSettings {
        min_redeem_value: 200,
        max_redeem_per_order: 1_000,
        ..Default::default()
    };
    let env = service_with_settings(settings);
    let svc = &env.service;
    svc.adjust(CUSTOMER, 5_000, "initial grant").unwrap();

    // 100 points at 0.01/point is 100 cents, below the 200 cent minimum
    let err = svc.reserve(CUSTOMER, 100, "order-7").unwrap_err();
    assert!(matches!(err, RewardError::RedemptionBelowMinimum { .. }));

    let err = svc.reserve(CUSTOMER, 1_500, "order-8").unwrap_err();
    assert!(matches!(err, RewardError::RedemptionOverCap { .. }));

    svc.reserve(CUSTOMER, 1_000, "order-9").unwrap();
}

#[test]
fn test_commit_without_reservation() {
    let env = service_with_defaults();
    let err = env.service.commit_redeem(CUSTOMER, "order-void").unwrap_err();
    assert!(matches!(err, RewardError::NoReservationFound { .. }));
}

#[test]
fn test_refund_restores_balance_and_is_idempotent() {
    let env = service_with_defaults();
    let svc = &env.service;

    svc.adjust(CUSTOMER, 1000, "initial grant").unwrap();
    svc.reserve(CUSTOMER, 500, "order-10").unwrap();
    svc.commit_redeem(CUSTOMER, "order-10").unwrap();
    assert_eq!(svc.balance_of(CUSTOMER).balance, 500);

    let txn = svc.refund(CUSTOMER, "order-10", 500).unwrap();
    assert_eq!(txn.txn_type, TxnType::Refunded);
    // Round trip: the balance is back where it started.
    assert_eq!(svc.balance_of(CUSTOMER).balance, 1000);

    let again = svc.refund(CUSTOMER, "order-10", 500).unwrap();
    assert_eq!(again.id, txn.id);
    assert_eq!(svc.balance_of(CUSTOMER).balance, 1000);
}

#[test]
fn test_remove_caps_at_available() {
    let env = service_with_defaults();
    let svc = &env.service;

    // Customer earned 100 on a settled order, then reserved 80 of them on a
    // different, still-open order.
    let outcome = svc.earn(CUSTOMER, 10_000, "order-11").unwrap();
    assert_eq!(outcome.points(), 100);
    svc.reserve(CUSTOMER, 80, "order-12").unwrap();

    // Cancelling order-11 may only claw back what is not spoken for.
    let outcome = svc.remove(CUSTOMER, "order-11", 100).unwrap();
    assert_eq!(outcome.removed, 20);
    assert_eq!(outcome.shortfall, 80);

    let summary = svc.balance_of(CUSTOMER);
    assert_eq!(summary.balance, 80);
    assert_eq!(summary.reserved, 80);
    assert_eq!(summary.available, 0);

    // Redelivery reports the recorded removal without touching the balance.
    let again = svc.remove(CUSTOMER, "order-11", 100).unwrap();
    assert_eq!(again.removed, 20);
    assert_eq!(svc.balance_of(CUSTOMER).balance, 80);
}

#[test]
fn test_adjust_rejects_overdraft() {
    let env = service_with_defaults();
    let svc = &env.service;

    svc.adjust(CUSTOMER, 100, "initial grant").unwrap();
    svc.reserve(CUSTOMER, 60, "order-13").unwrap();

    let err = svc.adjust(CUSTOMER, -50, "correction").unwrap_err();
    assert!(matches!(err, RewardError::InsufficientAvailable { .. }));

    svc.adjust(CUSTOMER, -40, "correction").unwrap();
    assert_eq!(svc.balance_of(CUSTOMER).balance, 60);
}

#[test]
fn test_zero_balance_read_does_not_create_state() {
    let env = service_with_defaults();
    let summary = env.service.balance_of(999);
    assert_eq!(summary.balance, 0);
    assert_eq!(summary.available, 0);
    assert!(env.service.all_balances(0, 10, None).is_empty());
}

#[test]
fn test_all_balances_pagination() {
    let env = service_with_defaults();
    let svc = &env.service;

    for customer in 1..=5u64 {
        svc.adjust(customer, customer as i64 * 10, "seed").unwrap();
    }

    let page0 = svc.all_balances(0, 2, None);
    assert_eq!(page0.len(), 2);
    assert_eq!(page0[0].customer_id, 1);
    assert_eq!(page0[1].customer_id, 2);

    let page2 = svc.all_balances(2, 2, None);
    assert_eq!(page2.len(), 1);
    assert_eq!(page2[0].customer_id, 5);
    assert_eq!(page2[0].summary.balance, 50);
}

#[test]
fn test_restart_preserves_ledger_and_reservations() {
    let mut env = service_with_defaults();
    {
        let svc = &env.service;
        svc.adjust(CUSTOMER, 1000, "initial grant").unwrap();
        svc.reserve(CUSTOMER, 300, "order-14").unwrap();
        svc.earn(CUSTOMER, 5_000, "order-15").unwrap();
    }

    env = reopen(env);
    let svc = &env.service;

    let summary = svc.balance_of(CUSTOMER);
    assert_eq!(summary.balance, 1050);
    assert_eq!(summary.reserved, 300);
    assert_eq!(summary.lifetime_earned, 50);

    // The reservation is still live: committing it works after restart.
    let txn = svc.commit_redeem(CUSTOMER, "order-14").unwrap();
    assert_eq!(txn.points, -300);
    assert_eq!(svc.balance_of(CUSTOMER).balance, 750);
}

#[test]
fn test_concurrent_reserves_cannot_both_win() {
    let env = service_with_settings(RewardSettings {
        earn_rate: Decimal::ONE,
        ..Default::default()
    });
    let svc = env.service.clone();
    svc.adjust(CUSTOMER, 100, "initial grant").unwrap();

    let mut handles = Vec::new();
    for i in 0..2 {
        let svc = Arc::clone(&svc);
        handles.push(thread::spawn(move || {
            svc.reserve(CUSTOMER, 80, &format!("order-race-{}", i)).is_ok()
        }));
    }

    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    // Two concurrent holds against the same 100 available points: exactly
    // one check-then-act sequence may win.
    assert_eq!(wins, 1);
    let summary = svc.balance_of(CUSTOMER);
    assert_eq!(summary.reserved, 80);
    assert_eq!(summary.available, 20);
}
