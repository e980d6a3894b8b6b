use crate::management::{AssetTransferError, CollateralAsset, NativeAssetLedger};
use crate::numeric::{Collateral, Credit, WAD};
use crate::test_helpers::{
    custodian_principal, funded_state, init_arg, orchestrator_principal, owner, user, FlakyAsset,
};
use crate::{LoanError, LoanSystem, State};
use assert_matches::assert_matches;
use proptest::collection::vec as pvec;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

const FUNDS: u128 = 1_000_000 * WAD;

fn arb_collateral() -> impl Strategy<Value = u128> {
    1..100 * WAD
}

#[derive(Clone, Debug)]
enum Op {
    Deposit { user: u8, amount: u128 },
    Unlock { user: u8, share: u8 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3u8, arb_collateral()).prop_map(|(user, amount)| Op::Deposit { user, amount }),
        (0..3u8, 1..=100u8).prop_map(|(user, share)| Op::Unlock { user, share }),
    ]
}

fn approve_orchestrator(state: &mut State<FlakyAsset>, account: candid::Principal, amount: Credit) {
    state
        .ledger_mut()
        .approve(account, orchestrator_principal(), amount);
}

proptest! {
    #[test]
    fn deposit_mints_amount_times_rate(amount in arb_collateral()) {
        let alice = user(1);
        let mut state = funded_state(&[(alice, Collateral::new(FUNDS))]);

        let credited = state.deposit_collateral(alice, Collateral::new(amount)).unwrap();

        prop_assert_eq!(credited, Credit::new(amount * 3000));
        prop_assert_eq!(state.ledger().balance_of(alice), credited);
        prop_assert_eq!(state.custodian().collateral_of(alice), Collateral::new(amount));
        prop_assert_eq!(
            state.asset().balance_of(custodian_principal()),
            Collateral::new(amount)
        );
        prop_assert!(state.check_invariants().is_ok());
        prop_assert!(state.check_replay().is_ok());
    }

    #[test]
    fn unlock_releases_truncated_quotient(
        deposit in 1..1_000_000_000_000_000_000_000u128,
        whole in any::<u128>(),
        rest in 0..3000u128,
    ) {
        let alice = user(1);
        let mut state = funded_state(&[(alice, Collateral::new(FUNDS))]);
        let credited = state.deposit_collateral(alice, Collateral::new(deposit)).unwrap();

        let units = whole % deposit + 1;
        let credit = Credit::new((units * 3000 + rest).min(credited.to_raw()));
        approve_orchestrator(&mut state, alice, credit);
        let released = state.unlock_collateral(alice, credit).unwrap();

        prop_assert_eq!(released, Collateral::new(credit.to_raw() / 3000));
        prop_assert_eq!(
            state.custodian().collateral_of(alice),
            Collateral::new(deposit - released.to_raw())
        );
        prop_assert_eq!(
            state.ledger().balance_of(alice),
            Credit::new(credited.to_raw() - credit.to_raw())
        );
        prop_assert_eq!(state.ledger().allowance(alice, orchestrator_principal()), Credit::ZERO);
        prop_assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn full_round_trip_returns_all_collateral(amount in arb_collateral()) {
        let alice = user(1);
        let mut state = funded_state(&[(alice, Collateral::new(FUNDS))]);
        let credited = state.deposit_collateral(alice, Collateral::new(amount)).unwrap();
        approve_orchestrator(&mut state, alice, credited);
        let released = state.unlock_collateral(alice, credited).unwrap();

        prop_assert_eq!(released, Collateral::new(amount));
        prop_assert_eq!(state.custodian().collateral_of(alice), Collateral::ZERO);
        prop_assert_eq!(state.ledger().total_supply(), Credit::ZERO);
        prop_assert_eq!(state.asset().balance_of(alice), Collateral::new(FUNDS));
    }

    #[test]
    fn supply_stays_backed_under_random_flows(ops in pvec(arb_op(), 1..40)) {
        let users: Vec<_> = (0..3u8).map(user).collect();
        let funded: Vec<_> = users.iter().map(|u| (*u, Collateral::new(FUNDS))).collect();
        let mut state = funded_state(&funded);

        for op in ops {
            match op {
                Op::Deposit { user, amount } => {
                    let _ = state.deposit_collateral(users[user as usize], Collateral::new(amount));
                }
                Op::Unlock { user, share } => {
                    let account = users[user as usize];
                    let balance = state.ledger().balance_of(account).to_raw();
                    let credit = Credit::new(balance / 100 * share as u128);
                    approve_orchestrator(&mut state, account, credit);
                    let _ = state.unlock_collateral(account, credit);
                }
            }
            prop_assert!(state.check_invariants().is_ok());

            let backing: u128 = users
                .iter()
                .map(|u| state.custodian().collateral_of(*u).to_raw() * 3000)
                .sum();
            prop_assert!(state.ledger().total_supply().to_raw() <= backing);
        }
        prop_assert!(state.check_replay().is_ok());
    }
}

#[test]
fn failed_mint_refunds_custody() {
    let alice = user(1);
    let mut state = funded_state(&[(alice, Collateral::from_units(5))]);
    state.ledger_mut().pause(owner()).unwrap();
    let custodian_events = state.custodian().events().len();

    assert_eq!(
        state.deposit_collateral(alice, Collateral::from_units(1)),
        Err(LoanError::LedgerPaused)
    );

    assert_eq!(state.asset().balance_of(alice), Collateral::from_units(5));
    assert_eq!(state.asset().balance_of(custodian_principal()), Collateral::ZERO);
    assert_eq!(state.custodian().collateral_of(alice), Collateral::ZERO);
    assert_eq!(state.custodian().events().len(), custodian_events);
    assert!(state.orchestrator().events().is_empty());
    state.check_replay().unwrap();
}

#[test]
fn failed_refund_keeps_records_consistent() {
    let alice = user(1);
    let mut state = funded_state(&[(alice, Collateral::from_units(5))]);
    state.ledger_mut().pause(owner()).unwrap();
    state.asset_mut().frozen.insert(custodian_principal());

    assert_eq!(
        state.deposit_collateral(alice, Collateral::from_units(1)),
        Err(LoanError::LedgerPaused)
    );

    // The collateral is stranded with the custodian but no record claims it.
    assert_eq!(
        state.asset().balance_of(custodian_principal()),
        Collateral::from_units(1)
    );
    assert_eq!(state.custodian().collateral_of(alice), Collateral::ZERO);
    assert_eq!(state.ledger().balance_of(alice), Credit::ZERO);
    state.check_invariants().unwrap();
}

#[test]
fn failed_release_restores_credit_and_record() {
    let alice = user(1);
    let mut state = funded_state(&[(alice, Collateral::from_units(5))]);
    let credited = state
        .deposit_collateral(alice, Collateral::from_units(2))
        .unwrap();
    approve_orchestrator(&mut state, alice, credited);
    let ledger_events = state.ledger().events().len();
    state.asset_mut().frozen.insert(custodian_principal());

    assert_matches!(
        state.unlock_collateral(alice, Credit::from_units(3000)),
        Err(LoanError::CollateralTransferFailed(AssetTransferError::TemporarilyUnavailable(_)))
    );

    assert_eq!(state.ledger().balance_of(alice), credited);
    assert_eq!(state.ledger().total_supply(), credited);
    assert_eq!(
        state.ledger().allowance(alice, orchestrator_principal()),
        credited
    );
    assert_eq!(state.ledger().events().len(), ledger_events);
    assert_eq!(
        state.custodian().collateral_of(alice),
        Collateral::from_units(2)
    );
    state.check_invariants().unwrap();
    state.check_replay().unwrap();
}

#[test]
fn failed_debt_burn_rolls_back_liquidation() {
    let alice = user(1);
    let keeper = user(2);
    let mut args = init_arg();
    args.burn_debt_on_liquidation = true;
    let asset = FlakyAsset::funded(&[(alice, Collateral::from_units(5))]);
    let mut state = State::provision(args, asset).unwrap();

    state
        .deposit_collateral(alice, Collateral::from_units(2))
        .unwrap();
    state
        .ledger_mut()
        .mint(owner(), alice, Credit::from_units(4000))
        .unwrap();
    state.ledger_mut().pause(owner()).unwrap();

    assert_eq!(state.liquidate(keeper, alice), Err(LoanError::LedgerPaused));
    assert_eq!(
        state.custodian().collateral_of(alice),
        Collateral::from_units(2)
    );
    assert_eq!(state.custodian().seized(), Collateral::ZERO);
    state.check_replay().unwrap();

    state.ledger_mut().unpause(owner()).unwrap();
    let outcome = state.liquidate(keeper, alice).unwrap();
    assert_eq!(outcome.seized_amount, Collateral::from_units(2));
    assert_eq!(outcome.debt_burned, Credit::from_units(6000));
    assert_eq!(state.ledger().balance_of(alice), Credit::from_units(4000));
    state.check_invariants().unwrap();
}

#[test]
fn failed_sweep_keeps_seized_collateral_booked() {
    let alice = user(1);
    let mut state = funded_state(&[(alice, Collateral::from_units(5))]);
    state
        .deposit_collateral(alice, Collateral::from_units(2))
        .unwrap();
    state
        .ledger_mut()
        .mint(owner(), alice, Credit::from_units(4000))
        .unwrap();
    state.liquidate(user(2), alice).unwrap();
    let custodian_events = state.custodian().events().len();
    state.asset_mut().frozen.insert(custodian_principal());

    assert_matches!(
        state.sweep_seized(owner(), owner(), Collateral::from_units(2)),
        Err(LoanError::CollateralTransferFailed(_))
    );
    assert_eq!(state.custodian().seized(), Collateral::from_units(2));
    assert_eq!(state.custodian().events().len(), custodian_events);
    state.check_invariants().unwrap();
    state.check_replay().unwrap();
}

#[test]
fn anonymous_and_operator_cannot_use_the_system() {
    let mut state = funded_state(&[]);
    for caller in [
        candid::Principal::anonymous(),
        owner(),
        orchestrator_principal(),
        custodian_principal(),
    ] {
        assert_eq!(
            state.deposit_collateral(caller, Collateral::from_units(1)),
            Err(LoanError::Unauthorized("Only user can call this".to_string()))
        );
    }
    assert_matches!(
        state.liquidate(candid::Principal::anonymous(), user(1)),
        Err(LoanError::Unauthorized(_))
    );
}

#[test]
fn concurrent_users_are_serialized() {
    let users: Vec<_> = (0..8u8).map(user).collect();
    let mut asset = NativeAssetLedger::new();
    for u in &users {
        asset.fund(*u, Collateral::from_units(10)).unwrap();
    }
    let system = Arc::new(LoanSystem::provision(init_arg(), asset).unwrap());

    let handles: Vec<_> = users
        .iter()
        .map(|account| {
            let system = Arc::clone(&system);
            let account = *account;
            thread::spawn(move || {
                for _ in 0..5 {
                    let credited = system
                        .deposit_collateral(account, Collateral::from_units(1))
                        .unwrap();
                    system
                        .mutate_state(|s| {
                            s.ledger_mut()
                                .approve(account, orchestrator_principal(), credited)
                        })
                        .unwrap();
                    let half = Credit::new(credited.to_raw() / 2);
                    system.unlock_collateral(account, half).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    system
        .read_state(|s| {
            for account in &users {
                assert_eq!(
                    s.custodian().collateral_of(*account),
                    Collateral::new(5 * WAD / 2)
                );
                assert_eq!(s.ledger().balance_of(*account), Credit::from_units(7500));
            }
            assert_eq!(
                s.asset().balance_of(custodian_principal()),
                Collateral::new(20 * WAD)
            );
            s.check_invariants().unwrap();
            s.check_replay().unwrap();
        })
        .unwrap();
}
