//! Collateral bookkeeping, the health factor and liquidation.

use crate::event::{Event, EventLog};
use crate::ledger::CreditLedger;
use crate::numeric::{health_ratio, Collateral, Rate, Ratio};
use crate::{LoanError, INFO};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    #[default]
    NoPosition,
    Collateralized,
    PartiallyUnlocked,
    /// Collateral was seized. A new deposit reopens the position.
    Liquidated,
}

#[derive(Clone, Debug)]
pub struct CollateralCustodian {
    pub(crate) principal: Principal,
    pub(crate) admin: Principal,
    pub(crate) authorized_orchestrator: Option<Principal>,
    pub(crate) price_per_unit: Rate,
    pub(crate) liquidation_threshold: Ratio,
    /// Records are zeroed, never removed.
    pub(crate) collateral: BTreeMap<Principal, Collateral>,
    pub(crate) statuses: BTreeMap<Principal, PositionStatus>,
    /// Collateral taken from liquidated positions, still held by the custodian
    /// until the admin sweeps it.
    pub(crate) seized: Collateral,
    pub(crate) events: EventLog,
}

#[derive(Clone, Debug)]
pub struct CustodianCheckpoint {
    records: Vec<(Principal, Option<Collateral>, Option<PositionStatus>)>,
    seized: Collateral,
    events_len: usize,
}

impl CollateralCustodian {
    pub(crate) fn empty(
        principal: Principal,
        admin: Principal,
        price_per_unit: Rate,
        liquidation_threshold: Ratio,
    ) -> Self {
        Self {
            principal,
            admin,
            authorized_orchestrator: None,
            price_per_unit,
            liquidation_threshold,
            collateral: BTreeMap::new(),
            statuses: BTreeMap::new(),
            seized: Collateral::ZERO,
            events: EventLog::default(),
        }
    }

    pub fn new(
        principal: Principal,
        admin: Principal,
        price_per_unit: Rate,
        liquidation_threshold: Ratio,
    ) -> Self {
        let mut custodian = Self::empty(principal, admin, price_per_unit, liquidation_threshold);
        custodian.events.record(&Event::CustodianInit {
            custodian: principal,
            admin,
            price_per_unit,
            liquidation_threshold,
        });
        custodian
    }

    pub fn principal(&self) -> Principal {
        self.principal
    }

    pub fn admin(&self) -> Principal {
        self.admin
    }

    pub fn authorized_orchestrator(&self) -> Option<Principal> {
        self.authorized_orchestrator
    }

    pub fn price_per_unit(&self) -> Rate {
        self.price_per_unit
    }

    pub fn liquidation_threshold(&self) -> Ratio {
        self.liquidation_threshold
    }

    pub fn collateral_of(&self, account: Principal) -> Collateral {
        self.collateral.get(&account).copied().unwrap_or_default()
    }

    pub fn position_status(&self, account: Principal) -> PositionStatus {
        self.statuses.get(&account).copied().unwrap_or_default()
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Principal, &Collateral)> {
        self.collateral.iter()
    }

    pub fn total_recorded(&self) -> Collateral {
        self.collateral
            .values()
            .fold(Collateral::ZERO, |acc, c| acc.saturating_add(*c))
    }

    pub fn seized(&self) -> Collateral {
        self.seized
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// `(collateral * price_per_unit) / debt`, where the debt is the account's
    /// credit balance. Accounts without debt get [`Ratio::MAX`].
    pub fn health_factor(&self, account: Principal, ledger: &CreditLedger) -> Ratio {
        health_ratio(
            self.collateral_of(account),
            self.price_per_unit,
            ledger.balance_of(account),
        )
    }

    /// Replaces the single orchestrator trusted to mutate records.
    pub fn set_authorized_orchestrator(
        &mut self,
        caller: Principal,
        orchestrator: Principal,
    ) -> Result<(), LoanError> {
        if caller != self.admin {
            return Err(LoanError::Unauthorized("No admin role".to_string()));
        }
        self.apply_authorization(orchestrator);
        self.events.record(&Event::OrchestratorAuthorized {
            orchestrator,
            by: caller,
        });
        log!(
            INFO,
            "[set_authorized_orchestrator] {} now trusts {}",
            self.principal,
            orchestrator
        );
        Ok(())
    }

    fn require_orchestrator(&self, caller: Principal) -> Result<(), LoanError> {
        if self.authorized_orchestrator != Some(caller) {
            return Err(LoanError::Unauthorized(
                "Only the authorized orchestrator can call this".to_string(),
            ));
        }
        Ok(())
    }

    pub fn record_deposit(
        &mut self,
        caller: Principal,
        account: Principal,
        amount: Collateral,
    ) -> Result<(), LoanError> {
        self.require_orchestrator(caller)?;
        if amount.is_zero() {
            return Err(LoanError::AmountTooLow { minimum: 1 });
        }
        self.apply_deposit(account, amount)?;
        self.events
            .record(&Event::CollateralRecorded { account, amount });
        log!(
            INFO,
            "[record_deposit] {} collateral of {} is now {}",
            account,
            amount,
            self.collateral_of(account)
        );
        Ok(())
    }

    pub fn record_withdrawal(
        &mut self,
        caller: Principal,
        account: Principal,
        amount: Collateral,
    ) -> Result<(), LoanError> {
        self.require_orchestrator(caller)?;
        if amount.is_zero() {
            return Err(LoanError::AmountTooLow { minimum: 1 });
        }
        self.apply_withdrawal(account, amount)?;
        self.events
            .record(&Event::CollateralReleased { account, amount });
        log!(
            INFO,
            "[record_withdrawal] released {} of {}, {} left",
            amount,
            account,
            self.collateral_of(account)
        );
        Ok(())
    }

    /// Seizes the whole record of `account` if its health factor is below the
    /// threshold. The check and the seizure happen in the same call. Accounts
    /// without recorded collateral have no position to liquidate.
    pub fn liquidate(
        &mut self,
        caller: Principal,
        account: Principal,
        ledger: &CreditLedger,
    ) -> Result<Collateral, LoanError> {
        self.require_orchestrator(caller)?;
        let available = self.collateral_of(account);
        if available.is_zero() {
            return Err(LoanError::InsufficientCollateral {
                available,
                required: Collateral::new(1),
            });
        }
        let health_factor = self.health_factor(account, ledger);
        if health_factor >= self.liquidation_threshold {
            return Err(LoanError::HealthFactorStillSafe {
                health_factor,
                threshold: self.liquidation_threshold,
            });
        }
        let seized_amount = self.collateral_of(account);
        self.apply_liquidation(account, seized_amount)?;
        self.events.record(&Event::Liquidated {
            account,
            seized_amount,
            health_factor,
        });
        log!(
            INFO,
            "[liquidate] seized {} from {} at health factor {}",
            seized_amount,
            account,
            health_factor
        );
        Ok(seized_amount)
    }

    /// Books `amount` of seized collateral out to `to`. The caller moves the
    /// asset itself.
    pub fn sweep_seized(
        &mut self,
        caller: Principal,
        to: Principal,
        amount: Collateral,
    ) -> Result<(), LoanError> {
        if caller != self.admin {
            return Err(LoanError::Unauthorized("No admin role".to_string()));
        }
        if amount.is_zero() {
            return Err(LoanError::AmountTooLow { minimum: 1 });
        }
        self.apply_sweep(amount)?;
        self.events.record(&Event::SeizedSwept {
            to,
            amount,
            by: caller,
        });
        log!(
            INFO,
            "[sweep_seized] {} swept {} seized collateral to {}, {} left",
            caller,
            amount,
            to,
            self.seized
        );
        Ok(())
    }

    pub(crate) fn apply_authorization(&mut self, orchestrator: Principal) {
        self.authorized_orchestrator = Some(orchestrator);
    }

    pub(crate) fn apply_deposit(
        &mut self,
        account: Principal,
        amount: Collateral,
    ) -> Result<(), LoanError> {
        let updated = self
            .collateral_of(account)
            .checked_add(amount)
            .ok_or(LoanError::ArithmeticOverflow)?;
        self.collateral.insert(account, updated);
        self.statuses.insert(account, PositionStatus::Collateralized);
        Ok(())
    }

    pub(crate) fn apply_withdrawal(
        &mut self,
        account: Principal,
        amount: Collateral,
    ) -> Result<(), LoanError> {
        let available = self.collateral_of(account);
        let left = available
            .checked_sub(amount)
            .ok_or(LoanError::InsufficientCollateral {
                available,
                required: amount,
            })?;
        self.collateral.insert(account, left);
        let status = if left.is_zero() {
            PositionStatus::NoPosition
        } else {
            PositionStatus::PartiallyUnlocked
        };
        self.statuses.insert(account, status);
        Ok(())
    }

    pub(crate) fn apply_liquidation(
        &mut self,
        account: Principal,
        seized_amount: Collateral,
    ) -> Result<(), LoanError> {
        let available = self.collateral_of(account);
        if available != seized_amount {
            return Err(LoanError::InsufficientCollateral {
                available,
                required: seized_amount,
            });
        }
        let seized = self
            .seized
            .checked_add(seized_amount)
            .ok_or(LoanError::ArithmeticOverflow)?;
        self.collateral.insert(account, Collateral::ZERO);
        self.statuses.insert(account, PositionStatus::Liquidated);
        self.seized = seized;
        Ok(())
    }

    pub(crate) fn apply_sweep(&mut self, amount: Collateral) -> Result<(), LoanError> {
        self.seized = self
            .seized
            .checked_sub(amount)
            .ok_or(LoanError::InsufficientCollateral {
                available: self.seized,
                required: amount,
            })?;
        Ok(())
    }

    pub fn checkpoint(&self, accounts: &[Principal]) -> CustodianCheckpoint {
        CustodianCheckpoint {
            records: accounts
                .iter()
                .map(|account| {
                    (
                        *account,
                        self.collateral.get(account).copied(),
                        self.statuses.get(account).copied(),
                    )
                })
                .collect(),
            seized: self.seized,
            events_len: self.events.len(),
        }
    }

    pub fn rollback(&mut self, checkpoint: CustodianCheckpoint) {
        for (account, collateral, status) in checkpoint.records {
            match collateral {
                Some(amount) => self.collateral.insert(account, amount),
                None => self.collateral.remove(&account),
            };
            match status {
                Some(status) => self.statuses.insert(account, status),
                None => self.statuses.remove(&account),
            };
        }
        self.seized = checkpoint.seized;
        self.events.truncate(checkpoint.events_len);
    }

    pub fn check_semantically_eq(&self, other: &Self) -> Result<(), String> {
        ensure_eq!(self.principal, other.principal, "custodian principal does not match");
        ensure_eq!(self.admin, other.admin, "admin does not match");
        ensure_eq!(
            self.authorized_orchestrator,
            other.authorized_orchestrator,
            "authorized_orchestrator does not match"
        );
        ensure_eq!(self.price_per_unit, other.price_per_unit, "price_per_unit does not match");
        ensure_eq!(
            self.liquidation_threshold,
            other.liquidation_threshold,
            "liquidation_threshold does not match"
        );
        ensure_eq!(self.collateral, other.collateral, "collateral records do not match");
        ensure_eq!(self.statuses, other.statuses, "position statuses do not match");
        ensure_eq!(self.seized, other.seized, "seized collateral does not match");
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        for (account, amount) in &self.collateral {
            let status = self.position_status(*account);
            let open = matches!(
                status,
                PositionStatus::Collateralized | PositionStatus::PartiallyUnlocked
            );
            ensure!(
                open != amount.is_zero(),
                "account {} holds {} with status {:?}",
                account,
                amount,
                status
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::Credit;
    use assert_matches::assert_matches;

    fn admin() -> Principal {
        Principal::from_slice(&[1])
    }

    fn orchestrator() -> Principal {
        Principal::from_slice(&[8])
    }

    fn alice() -> Principal {
        Principal::from_slice(&[2])
    }

    fn custodian() -> CollateralCustodian {
        let mut custodian = CollateralCustodian::new(
            Principal::from_slice(&[7]),
            admin(),
            Rate::from_units(3000),
            crate::DEFAULT_LIQUIDATION_THRESHOLD,
        );
        custodian
            .set_authorized_orchestrator(admin(), orchestrator())
            .unwrap();
        custodian
    }

    fn ledger() -> CreditLedger {
        CreditLedger::new(
            Principal::from_slice(&[9]),
            admin(),
            "Collateral Stable".to_string(),
            "CSB".to_string(),
            Credit::ZERO,
        )
        .unwrap()
    }

    #[test]
    fn only_the_orchestrator_mutates_records() {
        let mut custodian = custodian();
        assert_eq!(
            custodian.record_deposit(admin(), alice(), Collateral::from_units(1)),
            Err(LoanError::Unauthorized(
                "Only the authorized orchestrator can call this".to_string()
            ))
        );
        assert_eq!(
            custodian.set_authorized_orchestrator(alice(), alice()),
            Err(LoanError::Unauthorized("No admin role".to_string()))
        );
        custodian
            .record_deposit(orchestrator(), alice(), Collateral::from_units(1))
            .unwrap();
        assert_eq!(custodian.collateral_of(alice()), Collateral::from_units(1));
        assert_eq!(
            custodian.position_status(alice()),
            PositionStatus::Collateralized
        );
    }

    #[test]
    fn zero_deposit_is_rejected() {
        let mut custodian = custodian();
        assert_eq!(
            custodian.record_deposit(orchestrator(), alice(), Collateral::ZERO),
            Err(LoanError::AmountTooLow { minimum: 1 })
        );
    }

    #[test]
    fn withdrawal_cannot_exceed_record() {
        let mut custodian = custodian();
        custodian
            .record_deposit(orchestrator(), alice(), Collateral::from_units(2))
            .unwrap();
        assert_eq!(
            custodian.record_withdrawal(orchestrator(), alice(), Collateral::from_units(3)),
            Err(LoanError::InsufficientCollateral {
                available: Collateral::from_units(2),
                required: Collateral::from_units(3),
            })
        );
        custodian
            .record_withdrawal(orchestrator(), alice(), Collateral::from_units(1))
            .unwrap();
        assert_eq!(
            custodian.position_status(alice()),
            PositionStatus::PartiallyUnlocked
        );
        custodian
            .record_withdrawal(orchestrator(), alice(), Collateral::from_units(1))
            .unwrap();
        assert_eq!(custodian.position_status(alice()), PositionStatus::NoPosition);
        custodian.check_invariants().unwrap();
    }

    #[test]
    fn debt_free_accounts_are_maximally_safe() {
        let custodian = custodian();
        assert_eq!(custodian.health_factor(alice(), &ledger()), Ratio::MAX);
    }

    #[test]
    fn liquidation_rechecks_the_health_factor() {
        let mut custodian = custodian();
        let mut ledger = ledger();
        custodian
            .record_deposit(orchestrator(), alice(), Collateral::from_units(2))
            .unwrap();
        ledger.mint(admin(), alice(), Credit::from_units(6000)).unwrap();
        assert_matches!(
            custodian.liquidate(orchestrator(), alice(), &ledger),
            Err(LoanError::HealthFactorStillSafe { .. })
        );

        ledger.mint(admin(), alice(), Credit::from_units(4000)).unwrap();
        assert_matches!(
            custodian.liquidate(admin(), alice(), &ledger),
            Err(LoanError::Unauthorized(_))
        );
        let seized = custodian.liquidate(orchestrator(), alice(), &ledger).unwrap();
        assert_eq!(seized, Collateral::from_units(2));
        assert_eq!(custodian.collateral_of(alice()), Collateral::ZERO);
        assert_eq!(custodian.seized(), Collateral::from_units(2));
        assert_eq!(custodian.position_status(alice()), PositionStatus::Liquidated);
        assert_matches!(
            custodian.events().last(),
            Some(Event::Liquidated { seized_amount, .. }) if seized_amount == Collateral::from_units(2)
        );

        // A liquidated account may deposit again.
        custodian
            .record_deposit(orchestrator(), alice(), Collateral::from_units(1))
            .unwrap();
        assert_eq!(
            custodian.position_status(alice()),
            PositionStatus::Collateralized
        );
    }

    #[test]
    fn accounts_without_collateral_cannot_be_liquidated() {
        let mut custodian = custodian();
        let mut ledger = ledger();
        ledger.mint(admin(), alice(), Credit::from_units(1)).unwrap();
        let events_before = custodian.events().len();

        assert_eq!(
            custodian.liquidate(orchestrator(), alice(), &ledger),
            Err(LoanError::InsufficientCollateral {
                available: Collateral::ZERO,
                required: Collateral::new(1),
            })
        );
        assert_eq!(custodian.position_status(alice()), PositionStatus::NoPosition);
        assert!(custodian.accounts().next().is_none());
        assert_eq!(custodian.events().len(), events_before);
    }

    #[test]
    fn health_factor_at_threshold_is_safe() {
        let mut custodian = custodian();
        let mut ledger = ledger();
        custodian
            .record_deposit(orchestrator(), alice(), Collateral::from_units(3))
            .unwrap();
        ledger.mint(admin(), alice(), Credit::from_units(10_000)).unwrap();

        assert_eq!(
            custodian.liquidate(orchestrator(), alice(), &ledger),
            Err(LoanError::HealthFactorStillSafe {
                health_factor: crate::DEFAULT_LIQUIDATION_THRESHOLD,
                threshold: crate::DEFAULT_LIQUIDATION_THRESHOLD,
            })
        );

        ledger.mint(admin(), alice(), Credit::new(1)).unwrap();
        assert!(custodian.health_factor(alice(), &ledger) < crate::DEFAULT_LIQUIDATION_THRESHOLD);
        custodian.liquidate(orchestrator(), alice(), &ledger).unwrap();
    }

    #[test]
    fn only_admin_sweeps_seized_collateral() {
        let mut custodian = custodian();
        let mut ledger = ledger();
        custodian
            .record_deposit(orchestrator(), alice(), Collateral::from_units(2))
            .unwrap();
        ledger.mint(admin(), alice(), Credit::from_units(10_000)).unwrap();
        custodian.liquidate(orchestrator(), alice(), &ledger).unwrap();

        assert_eq!(
            custodian.sweep_seized(alice(), alice(), Collateral::from_units(1)),
            Err(LoanError::Unauthorized("No admin role".to_string()))
        );
        assert_eq!(
            custodian.sweep_seized(admin(), admin(), Collateral::from_units(3)),
            Err(LoanError::InsufficientCollateral {
                available: Collateral::from_units(2),
                required: Collateral::from_units(3),
            })
        );
        custodian
            .sweep_seized(admin(), admin(), Collateral::from_units(2))
            .unwrap();
        assert_eq!(custodian.seized(), Collateral::ZERO);

        let replayed = crate::event::replay_custodian(custodian.events().events()).unwrap();
        replayed.check_semantically_eq(&custodian).unwrap();
    }

    #[test]
    fn rollback_and_replay() {
        let mut custodian = custodian();
        custodian
            .record_deposit(orchestrator(), alice(), Collateral::from_units(1))
            .unwrap();
        let checkpoint = custodian.checkpoint(&[alice()]);
        custodian
            .record_withdrawal(orchestrator(), alice(), Collateral::from_units(1))
            .unwrap();
        custodian.rollback(checkpoint);
        assert_eq!(custodian.collateral_of(alice()), Collateral::from_units(1));
        assert_eq!(
            custodian.position_status(alice()),
            PositionStatus::Collateralized
        );

        let replayed = crate::event::replay_custodian(custodian.events().events()).unwrap();
        replayed.check_semantically_eq(&custodian).unwrap();
    }
}
