//! User-facing entry points that move custody and credit in lockstep.
//!
//! Every flow touches the custodian records, the credit ledger and the
//! collateral asset. A flow first checkpoints the entries it may touch; when
//! any step fails, both stores are rolled back and a custody transfer that
//! already happened is refunded, so callers observe all or nothing.

use crate::custodian::CollateralCustodian;
use crate::event::{Event, EventLog};
use crate::ledger::CreditLedger;
use crate::management::CollateralAsset;
use crate::numeric::{Collateral, Credit, Rate, WAD};
use crate::{LoanError, UnlockSettlement, DEBUG, INFO};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};

#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationOutcome {
    pub account: Principal,
    pub seized_amount: Collateral,
    pub debt_burned: Credit,
}

#[derive(Clone, Debug)]
pub struct LoanOrchestrator {
    pub(crate) principal: Principal,
    pub(crate) owner: Principal,
    pub(crate) price_per_unit: Rate,
    pub(crate) unlock_settlement: UnlockSettlement,
    pub(crate) burn_debt_on_liquidation: bool,
    pub(crate) events: EventLog,
}

fn reject(operation: &str, caller: Principal, error: LoanError) -> LoanError {
    log!(DEBUG, "[{}] rejected call from {}: {}", operation, caller, error);
    error
}

impl LoanOrchestrator {
    pub fn new(
        principal: Principal,
        owner: Principal,
        price_per_unit: Rate,
        unlock_settlement: UnlockSettlement,
        burn_debt_on_liquidation: bool,
    ) -> Self {
        Self {
            principal,
            owner,
            price_per_unit,
            unlock_settlement,
            burn_debt_on_liquidation,
            events: EventLog::default(),
        }
    }

    pub fn principal(&self) -> Principal {
        self.principal
    }

    pub fn owner(&self) -> Principal {
        self.owner
    }

    pub fn price_per_unit(&self) -> Rate {
        self.price_per_unit
    }

    pub fn unlock_settlement(&self) -> UnlockSettlement {
        self.unlock_settlement
    }

    pub fn burns_debt_on_liquidation(&self) -> bool {
        self.burn_debt_on_liquidation
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Rejects the operator, the tenant's own components and every holder of
    /// a ledger capability.
    fn require_user(
        &self,
        caller: Principal,
        ledger: &CreditLedger,
        custodian: &CollateralCustodian,
    ) -> Result<(), LoanError> {
        let privileged = caller == Principal::anonymous()
            || caller == self.owner
            || caller == self.principal
            || caller == ledger.principal()
            || caller == custodian.principal()
            || caller == custodian.admin()
            || ledger.holds_any_role(caller);
        if privileged {
            return Err(LoanError::Unauthorized("Only user can call this".to_string()));
        }
        Ok(())
    }

    /// Takes `amount` of the caller's collateral into custody and mints
    /// `amount * price_per_unit` credit to the caller.
    pub fn deposit_collateral<A: CollateralAsset + ?Sized>(
        &mut self,
        caller: Principal,
        amount: Collateral,
        ledger: &mut CreditLedger,
        custodian: &mut CollateralCustodian,
        asset: &mut A,
    ) -> Result<Credit, LoanError> {
        const OP: &str = "deposit_collateral";
        self.require_user(caller, ledger, custodian)
            .map_err(|e| reject(OP, caller, e))?;
        if amount.is_zero() {
            return Err(reject(OP, caller, LoanError::AmountTooLow { minimum: 1 }));
        }
        let credited = amount
            .checked_mul_rate(self.price_per_unit)
            .ok_or_else(|| reject(OP, caller, LoanError::ArithmeticOverflow))?;

        let ledger_checkpoint = ledger.checkpoint(&[caller], &[]);
        let custodian_checkpoint = custodian.checkpoint(&[caller]);

        asset
            .transfer(caller, custodian.principal(), amount)
            .map_err(|e| reject(OP, caller, e.into()))?;

        let booked = custodian
            .record_deposit(self.principal, caller, amount)
            .and_then(|()| ledger.mint(self.principal, caller, credited));
        if let Err(error) = booked {
            custodian.rollback(custodian_checkpoint);
            ledger.rollback(ledger_checkpoint);
            if let Err(refund_error) = asset.transfer(custodian.principal(), caller, amount) {
                log!(
                    INFO,
                    "[{}] CRITICAL: failed to refund {} collateral to {}: {}",
                    OP,
                    amount,
                    caller,
                    refund_error
                );
            }
            log!(
                INFO,
                "[{}] rolled back deposit of {} by {}: {}",
                OP,
                amount,
                caller,
                error
            );
            return Err(error);
        }

        self.events.record(&Event::DepositRecorded {
            account: caller,
            custodian: custodian.principal(),
            amount,
        });
        self.events.record(&Event::CreditMinted {
            ledger: ledger.principal(),
            account: caller,
            amount: credited,
        });
        log!(
            INFO,
            "[{}] {} deposited {} collateral and received {} credit",
            OP,
            caller,
            amount,
            credited
        );
        Ok(credited)
    }

    /// Takes back `credit` from the caller and releases
    /// `credit / price_per_unit` collateral, truncated. The caller must have
    /// approved the orchestrator to spend `credit`.
    pub fn unlock_collateral<A: CollateralAsset + ?Sized>(
        &mut self,
        caller: Principal,
        credit: Credit,
        ledger: &mut CreditLedger,
        custodian: &mut CollateralCustodian,
        asset: &mut A,
    ) -> Result<Collateral, LoanError> {
        const OP: &str = "unlock_collateral";
        self.require_user(caller, ledger, custodian)
            .map_err(|e| reject(OP, caller, e))?;
        if credit.is_zero() {
            return Err(reject(OP, caller, LoanError::AmountTooLow { minimum: 1 }));
        }
        let balance = ledger.balance_of(caller);
        if credit > balance {
            return Err(reject(
                OP,
                caller,
                LoanError::InsufficientBalance {
                    balance,
                    required: credit,
                },
            ));
        }
        let released = credit
            .checked_div_rate(self.price_per_unit)
            .ok_or_else(|| reject(OP, caller, LoanError::ArithmeticOverflow))?;
        if released.is_zero() {
            let minimum = self.price_per_unit.to_raw().div_ceil(WAD);
            return Err(reject(OP, caller, LoanError::AmountTooLow { minimum }));
        }

        let ledger_checkpoint = ledger.checkpoint(
            &[caller, self.principal],
            &[(caller, self.principal)],
        );
        let custodian_checkpoint = custodian.checkpoint(&[caller]);

        if let Err(error) = self.settle_unlock(caller, credit, released, ledger, custodian, asset) {
            custodian.rollback(custodian_checkpoint);
            ledger.rollback(ledger_checkpoint);
            log!(
                INFO,
                "[{}] rolled back unlock of {} credit by {}: {}",
                OP,
                credit,
                caller,
                error
            );
            return Err(error);
        }

        self.events.record(&Event::CreditBurnedOrReturned {
            account: caller,
            ledger: ledger.principal(),
            amount: credit,
        });
        self.events.record(&Event::CollateralDecreased {
            account: caller,
            amount: released,
        });
        log!(
            INFO,
            "[{}] {} returned {} credit and got back {} collateral",
            OP,
            caller,
            credit,
            released
        );
        Ok(released)
    }

    fn settle_unlock<A: CollateralAsset + ?Sized>(
        &self,
        caller: Principal,
        credit: Credit,
        released: Collateral,
        ledger: &mut CreditLedger,
        custodian: &mut CollateralCustodian,
        asset: &mut A,
    ) -> Result<(), LoanError> {
        match self.unlock_settlement {
            UnlockSettlement::Burn => ledger.burn_from(self.principal, caller, credit)?,
            UnlockSettlement::Escrow => {
                ledger.transfer_from(self.principal, caller, self.principal, credit)?
            }
        }
        custodian.record_withdrawal(self.principal, caller, released)?;
        asset.transfer(custodian.principal(), caller, released)?;
        Ok(())
    }

    /// Seizes the collateral of an unhealthy `account`. Any non-anonymous
    /// caller may trigger it; the custodian re-validates the health factor.
    pub fn liquidate(
        &mut self,
        caller: Principal,
        account: Principal,
        ledger: &mut CreditLedger,
        custodian: &mut CollateralCustodian,
    ) -> Result<LiquidationOutcome, LoanError> {
        const OP: &str = "liquidate";
        if caller == Principal::anonymous() {
            return Err(reject(
                OP,
                caller,
                LoanError::Unauthorized("Anonymous principal cannot liquidate".to_string()),
            ));
        }

        let ledger_checkpoint = ledger.checkpoint(&[account], &[]);
        let custodian_checkpoint = custodian.checkpoint(&[account]);

        let seized_amount = custodian
            .liquidate(self.principal, account, ledger)
            .map_err(|e| reject(OP, caller, e))?;

        let mut debt_burned = Credit::ZERO;
        if self.burn_debt_on_liquidation {
            let balance = ledger.balance_of(account);
            debt_burned = seized_amount
                .checked_mul_rate(self.price_per_unit)
                .map_or(balance, |value| value.min(balance));
            if !debt_burned.is_zero() {
                if let Err(error) = ledger.burn(self.principal, account, debt_burned) {
                    custodian.rollback(custodian_checkpoint);
                    ledger.rollback(ledger_checkpoint);
                    log!(
                        INFO,
                        "[{}] rolled back liquidation of {}: {}",
                        OP,
                        account,
                        error
                    );
                    return Err(error);
                }
            }
        }

        self.events.record(&Event::PositionLiquidated {
            account,
            seized_amount,
            debt_burned,
            liquidator: caller,
        });
        log!(
            INFO,
            "[{}] {} liquidated {}: seized {} collateral, burned {} credit",
            OP,
            caller,
            account,
            seized_amount,
            debt_burned
        );
        Ok(LiquidationOutcome {
            account,
            seized_amount,
            debt_burned,
        })
    }
}
