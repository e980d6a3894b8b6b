//! Movement of the base asset between users and the custodian.

use crate::numeric::Collateral;
use candid::{CandidType, Deserialize, Principal};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetTransferError {
    InsufficientFunds { balance: Collateral },
    BalanceOverflow,
    TemporarilyUnavailable(String),
}

impl fmt::Display for AssetTransferError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientFunds { balance } => {
                write!(fmt, "insufficient funds, balance is {}", balance)
            }
            Self::BalanceOverflow => write!(fmt, "receiver balance would overflow"),
            Self::TemporarilyUnavailable(msg) => write!(fmt, "asset ledger unavailable: {}", msg),
        }
    }
}

/// Custody of the collateral asset. The orchestrator moves funds through this
/// trait; the custodian's balance on it is the collateral actually held.
pub trait CollateralAsset {
    fn balance_of(&self, account: Principal) -> Collateral;

    /// Moves `amount` from `from` to `to`. A failed transfer changes nothing.
    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: Collateral,
    ) -> Result<(), AssetTransferError>;
}

/// In-memory balances of the base asset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeAssetLedger {
    balances: BTreeMap<Principal, Collateral>,
}

impl NativeAssetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits `amount` to `account` out of thin air, e.g. to seed test wallets.
    pub fn fund(&mut self, account: Principal, amount: Collateral) -> Result<(), AssetTransferError> {
        let balance = self
            .balance_of(account)
            .checked_add(amount)
            .ok_or(AssetTransferError::BalanceOverflow)?;
        self.balances.insert(account, balance);
        Ok(())
    }

    pub fn total(&self) -> Collateral {
        self.balances
            .values()
            .fold(Collateral::ZERO, |acc, b| acc.saturating_add(*b))
    }
}

impl CollateralAsset for NativeAssetLedger {
    fn balance_of(&self, account: Principal) -> Collateral {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    fn transfer(
        &mut self,
        from: Principal,
        to: Principal,
        amount: Collateral,
    ) -> Result<(), AssetTransferError> {
        let from_balance = self.balance_of(from);
        let debited = from_balance
            .checked_sub(amount)
            .ok_or(AssetTransferError::InsufficientFunds {
                balance: from_balance,
            })?;
        if from == to {
            return Ok(());
        }
        let credited = self
            .balance_of(to)
            .checked_add(amount)
            .ok_or(AssetTransferError::BalanceOverflow)?;
        self.balances.insert(from, debited);
        self.balances.insert(to, credited);
        Ok(())
    }
}
