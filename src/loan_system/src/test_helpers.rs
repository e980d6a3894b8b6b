//! Helpers for unit tests: tenant fixtures and a collateral asset with
//! injectable failures.

use crate::management::{AssetTransferError, CollateralAsset, NativeAssetLedger};
use crate::numeric::Collateral;
use crate::state::State;
use crate::InitArg;
use candid::Principal;
use std::collections::BTreeSet;

pub fn owner() -> Principal {
    Principal::from_slice(&[1])
}

pub fn ledger_principal() -> Principal {
    Principal::from_slice(&[10])
}

pub fn custodian_principal() -> Principal {
    Principal::from_slice(&[11])
}

pub fn orchestrator_principal() -> Principal {
    Principal::from_slice(&[12])
}

pub fn user(n: u8) -> Principal {
    Principal::from_slice(&[100, n])
}

pub fn init_arg() -> InitArg {
    InitArg::new(
        owner(),
        ledger_principal(),
        custodian_principal(),
        orchestrator_principal(),
    )
}

/// Asset ledger that refuses transfers out of selected accounts.
#[derive(Clone, Debug, Default)]
pub struct FlakyAsset {
    pub inner: NativeAssetLedger,
    pub frozen: BTreeSet<Principal>,
}

impl FlakyAsset {
    pub fn funded(accounts: &[(Principal, Collateral)]) -> Self {
        let mut inner = NativeAssetLedger::new();
        for (account, amount) in accounts {
            inner.fund(*account, *amount).unwrap();
        }
        Self {
            inner,
            frozen: BTreeSet::new(),
        }
    }
}

impl CollateralAsset for FlakyAsset {
    fn balance_of(&self, account: Principal) -> Collateral {
        self.inner.balance_of(account)
    }

    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: Collateral,
    ) -> Result<(), AssetTransferError> {
        if self.frozen.contains(&from) {
            return Err(AssetTransferError::TemporarilyUnavailable(format!(
                "transfers from {} are frozen",
                from
            )));
        }
        self.inner.transfer(from, to, amount)
    }
}

/// A provisioned tenant whose users start with the given collateral.
pub fn funded_state(accounts: &[(Principal, Collateral)]) -> State<FlakyAsset> {
    State::provision(init_arg(), FlakyAsset::funded(accounts)).unwrap()
}
