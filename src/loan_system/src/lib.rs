use candid::{CandidType, Deserialize, Principal};
use serde::Serialize;
use std::fmt;

use crate::management::AssetTransferError;
use crate::numeric::{Collateral, Credit, Rate, Ratio};

// Like assert_eq, but returns an error instead of panicking.
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if $lhs != $rhs {
            return Err(format!("{} ({:?}) != {} ({:?}): {}",
                               std::stringify!($lhs), $lhs,
                               std::stringify!($rhs), $rhs,
                               format!($msg $(,$args)*)));
        }
    }
}

macro_rules! ensure {
    ($cond:expr, $msg:expr $(, $args:expr)* $(,)*) => {
        if !$cond {
            return Err(format!("Condition {} is false: {}",
                               std::stringify!($cond),
                               format!($msg $(,$args)*)));
        }
    }
}

pub mod custodian;
pub mod event;
pub mod ledger;
pub mod logs;
pub mod management;
pub mod numeric;
pub mod orchestrator;
pub mod state;

#[cfg(test)]
mod test_helpers;

#[cfg(test)]
mod tests;

pub use crate::logs::{DEBUG, INFO};
pub use crate::state::{LoanSystem, State, SystemRefs};

/// Every balance and collateral record is keyed by an opaque principal.
pub type Account = Principal;

pub const DEFAULT_PRICE_PER_UNIT: Rate = Rate::from_units(3000);
pub const DEFAULT_LIQUIDATION_THRESHOLD: Ratio = Ratio::new(900_000_000_000_000_000); // 0.9
pub const DEFAULT_TOKEN_NAME: &str = "Collateral Stable";
pub const DEFAULT_TOKEN_SYMBOL: &str = "CSB";

/// What happens to the credit a user hands back when unlocking collateral.
#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlockSettlement {
    /// The credit is destroyed, keeping the supply backed by recorded collateral.
    #[default]
    #[serde(rename = "burn")]
    Burn,
    /// The credit moves to the orchestrator's own ledger account.
    #[serde(rename = "escrow")]
    Escrow,
}

/// Provisioning parameters of one tenant instance.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitArg {
    pub owner: Principal,
    pub ledger_principal: Principal,
    pub custodian_principal: Principal,
    pub orchestrator_principal: Principal,
    #[serde(default = "default_price_per_unit")]
    pub price_per_unit: Rate,
    #[serde(default = "default_liquidation_threshold")]
    pub liquidation_threshold: Ratio,
    #[serde(default)]
    pub initial_credit_reserve: Credit,
    #[serde(default)]
    pub unlock_settlement: UnlockSettlement,
    #[serde(default)]
    pub burn_debt_on_liquidation: bool,
    #[serde(default = "default_token_name")]
    pub token_name: String,
    #[serde(default = "default_token_symbol")]
    pub token_symbol: String,
}

fn default_price_per_unit() -> Rate {
    DEFAULT_PRICE_PER_UNIT
}

fn default_liquidation_threshold() -> Ratio {
    DEFAULT_LIQUIDATION_THRESHOLD
}

fn default_token_name() -> String {
    DEFAULT_TOKEN_NAME.to_string()
}

fn default_token_symbol() -> String {
    DEFAULT_TOKEN_SYMBOL.to_string()
}

impl InitArg {
    pub fn new(
        owner: Principal,
        ledger_principal: Principal,
        custodian_principal: Principal,
        orchestrator_principal: Principal,
    ) -> Self {
        Self {
            owner,
            ledger_principal,
            custodian_principal,
            orchestrator_principal,
            price_per_unit: DEFAULT_PRICE_PER_UNIT,
            liquidation_threshold: DEFAULT_LIQUIDATION_THRESHOLD,
            initial_credit_reserve: Credit::ZERO,
            unlock_settlement: UnlockSettlement::Burn,
            burn_debt_on_liquidation: false,
            token_name: default_token_name(),
            token_symbol: default_token_symbol(),
        }
    }

    /// Principals are written in their textual form, amounts as raw 18-decimal integers.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validate(&self) -> Result<(), LoanError> {
        if self.price_per_unit.is_zero() {
            return Err(LoanError::InvalidConfiguration(
                "price_per_unit must be positive".to_string(),
            ));
        }
        if self.liquidation_threshold.is_zero() {
            return Err(LoanError::InvalidConfiguration(
                "liquidation_threshold must be positive".to_string(),
            ));
        }
        let principals = [
            self.owner,
            self.ledger_principal,
            self.custodian_principal,
            self.orchestrator_principal,
        ];
        for (i, p) in principals.iter().enumerate() {
            if *p == Principal::anonymous() {
                return Err(LoanError::InvalidConfiguration(
                    "anonymous principal in provisioning arguments".to_string(),
                ));
            }
            if principals[i + 1..].contains(p) {
                return Err(LoanError::InvalidConfiguration(format!(
                    "principal {} is used for more than one role",
                    p
                )));
            }
        }
        Ok(())
    }
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanError {
    /// A capability or caller-role check failed.
    Unauthorized(String),
    InsufficientBalance { balance: Credit, required: Credit },
    InsufficientAllowance { allowance: Credit, required: Credit },
    InsufficientCollateral { available: Collateral, required: Collateral },
    HealthFactorStillSafe { health_factor: Ratio, threshold: Ratio },
    LedgerPaused,
    AmountTooLow { minimum: u128 },
    ArithmeticOverflow,
    CollateralTransferFailed(AssetTransferError),
    InvalidConfiguration(String),
    TemporarilyUnavailable(String),
}

impl fmt::Display for LoanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(reason) => write!(f, "unauthorized: {}", reason),
            Self::InsufficientBalance { balance, required } => write!(
                f,
                "insufficient balance: {} available, {} required",
                balance, required
            ),
            Self::InsufficientAllowance {
                allowance,
                required,
            } => write!(
                f,
                "insufficient allowance: {} approved, {} required",
                allowance, required
            ),
            Self::InsufficientCollateral {
                available,
                required,
            } => write!(
                f,
                "insufficient collateral: {} recorded, {} required",
                available, required
            ),
            Self::HealthFactorStillSafe {
                health_factor,
                threshold,
            } => write!(
                f,
                "health factor {} is not below the liquidation threshold {}",
                health_factor, threshold
            ),
            Self::LedgerPaused => write!(f, "the credit ledger is paused"),
            Self::AmountTooLow { minimum } => {
                write!(f, "amount too low, minimum is {} raw units", minimum)
            }
            Self::ArithmeticOverflow => write!(f, "arithmetic overflow"),
            Self::CollateralTransferFailed(e) => write!(f, "collateral transfer failed: {}", e),
            Self::InvalidConfiguration(msg) => write!(f, "invalid configuration: {}", msg),
            Self::TemporarilyUnavailable(msg) => write!(f, "temporarily unavailable: {}", msg),
        }
    }
}

impl std::error::Error for LoanError {}

impl From<AssetTransferError> for LoanError {
    fn from(e: AssetTransferError) -> Self {
        Self::CollateralTransferFailed(e)
    }
}
