use crate::custodian::CollateralCustodian;
use crate::event::{replay_custodian, replay_ledger};
use crate::ledger::{CreditLedger, Role};
use crate::management::CollateralAsset;
use crate::numeric::{Collateral, Credit, Ratio};
use crate::orchestrator::{LiquidationOutcome, LoanOrchestrator};
use crate::{InitArg, LoanError, DEBUG, INFO};
use candid::{CandidType, Deserialize, Principal};
use ic_canister_log::log;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

/// Addresses of one tenant's components.
#[derive(CandidType, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRefs {
    pub ledger: Principal,
    pub custodian: Principal,
    pub orchestrator: Principal,
}

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidatablePosition {
    pub account: Principal,
    pub collateral: Collateral,
    pub debt: Credit,
    pub health_factor: Ratio,
}

/// One tenant: a ledger, a custodian and an orchestrator wired together,
/// plus the collateral asset they custody.
#[derive(Debug)]
pub struct State<A> {
    pub(crate) owner: Principal,
    pub(crate) ledger: CreditLedger,
    pub(crate) custodian: CollateralCustodian,
    pub(crate) orchestrator: LoanOrchestrator,
    pub(crate) asset: A,
}

impl<A: CollateralAsset> State<A> {
    /// The owner holds every ledger capability and administers the
    /// custodian; the orchestrator may mint and is the custodian's only
    /// trusted caller.
    pub fn provision(args: InitArg, asset: A) -> Result<Self, LoanError> {
        args.validate()?;
        let mut ledger = CreditLedger::new(
            args.ledger_principal,
            args.owner,
            args.token_name.clone(),
            args.token_symbol.clone(),
            args.initial_credit_reserve,
        )?;
        ledger.grant_role(args.owner, Role::Minter, args.orchestrator_principal)?;

        let mut custodian = CollateralCustodian::new(
            args.custodian_principal,
            args.owner,
            args.price_per_unit,
            args.liquidation_threshold,
        );
        custodian.set_authorized_orchestrator(args.owner, args.orchestrator_principal)?;

        let orchestrator = LoanOrchestrator::new(
            args.orchestrator_principal,
            args.owner,
            args.price_per_unit,
            args.unlock_settlement,
            args.burn_debt_on_liquidation,
        );

        log!(
            INFO,
            "[provision] owner {}: ledger {}, custodian {}, orchestrator {}, rate {}, threshold {}",
            args.owner,
            args.ledger_principal,
            args.custodian_principal,
            args.orchestrator_principal,
            args.price_per_unit,
            args.liquidation_threshold
        );

        Ok(Self {
            owner: args.owner,
            ledger,
            custodian,
            orchestrator,
            asset,
        })
    }

    pub fn owner(&self) -> Principal {
        self.owner
    }

    pub fn refs(&self) -> SystemRefs {
        SystemRefs {
            ledger: self.ledger.principal(),
            custodian: self.custodian.principal(),
            orchestrator: self.orchestrator.principal(),
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// Direct ledger access for capability holders (minting, pausing, roles).
    pub fn ledger_mut(&mut self) -> &mut CreditLedger {
        &mut self.ledger
    }

    pub fn custodian(&self) -> &CollateralCustodian {
        &self.custodian
    }

    pub fn custodian_mut(&mut self) -> &mut CollateralCustodian {
        &mut self.custodian
    }

    pub fn orchestrator(&self) -> &LoanOrchestrator {
        &self.orchestrator
    }

    pub fn asset(&self) -> &A {
        &self.asset
    }

    pub fn asset_mut(&mut self) -> &mut A {
        &mut self.asset
    }

    pub fn deposit_collateral(
        &mut self,
        caller: Principal,
        amount: Collateral,
    ) -> Result<Credit, LoanError> {
        let Self {
            ledger,
            custodian,
            orchestrator,
            asset,
            ..
        } = self;
        orchestrator.deposit_collateral(caller, amount, ledger, custodian, asset)
    }

    pub fn unlock_collateral(
        &mut self,
        caller: Principal,
        credit: Credit,
    ) -> Result<Collateral, LoanError> {
        let Self {
            ledger,
            custodian,
            orchestrator,
            asset,
            ..
        } = self;
        orchestrator.unlock_collateral(caller, credit, ledger, custodian, asset)
    }

    pub fn liquidate(
        &mut self,
        caller: Principal,
        account: Principal,
    ) -> Result<LiquidationOutcome, LoanError> {
        let Self {
            ledger,
            custodian,
            orchestrator,
            ..
        } = self;
        orchestrator.liquidate(caller, account, ledger, custodian)
    }

    /// Pays seized collateral out of custody. Only the custodian admin may
    /// call this; the record and the asset move together or not at all.
    pub fn sweep_seized(
        &mut self,
        caller: Principal,
        to: Principal,
        amount: Collateral,
    ) -> Result<(), LoanError> {
        let checkpoint = self.custodian.checkpoint(&[]);
        self.custodian.sweep_seized(caller, to, amount)?;
        if let Err(error) = self.asset.transfer(self.custodian.principal(), to, amount) {
            self.custodian.rollback(checkpoint);
            log!(
                INFO,
                "[sweep_seized] rolled back sweep of {} to {}: {}",
                amount,
                to,
                error
            );
            return Err(error.into());
        }
        Ok(())
    }

    pub fn health_factor(&self, account: Principal) -> Ratio {
        self.custodian.health_factor(account, &self.ledger)
    }

    /// Reports open positions whose health factor is below the liquidation
    /// threshold. Nothing is liquidated.
    pub fn check_positions(&self) -> Vec<LiquidatablePosition> {
        let threshold = self.custodian.liquidation_threshold();
        let unhealthy: Vec<LiquidatablePosition> = self
            .custodian
            .accounts()
            .filter(|(_, collateral)| !collateral.is_zero())
            .map(|(account, collateral)| LiquidatablePosition {
                account: *account,
                collateral: *collateral,
                debt: self.ledger.balance_of(*account),
                health_factor: self.health_factor(*account),
            })
            .filter(|position| position.health_factor < threshold)
            .collect();

        for position in &unhealthy {
            log!(
                DEBUG,
                "[check_positions] {} holds {} against {} debt, health factor {}",
                position.account,
                position.collateral,
                position.debt,
                position.health_factor
            );
        }
        if !unhealthy.is_empty() {
            log!(
                INFO,
                "[check_positions] found {} positions below {}",
                unhealthy.len(),
                threshold
            );
        }
        unhealthy
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        self.ledger.check_invariants()?;
        self.custodian.check_invariants()?;

        let held = self.asset.balance_of(self.custodian.principal());
        let owed = self
            .custodian
            .accounts()
            .try_fold(self.custodian.seized(), |acc, (_, c)| acc.checked_add(*c));
        ensure!(
            owed.is_some_and(|owed| owed <= held),
            "custodian holds {} but owes {:?}",
            held,
            owed
        );
        Ok(())
    }

    /// Rebuilds the ledger and the custodian from their event logs and
    /// compares them with the live components.
    pub fn check_replay(&self) -> Result<(), String> {
        let ledger = replay_ledger(self.ledger.events().events())
            .map_err(|e| format!("failed to replay the ledger log: {:?}", e))?;
        ledger.check_invariants()?;
        ledger.check_semantically_eq(&self.ledger)?;

        let custodian = replay_custodian(self.custodian.events().events())
            .map_err(|e| format!("failed to replay the custodian log: {:?}", e))?;
        custodian.check_invariants()?;
        custodian.check_semantically_eq(&self.custodian)?;
        Ok(())
    }
}

/// A tenant instance behind a lock. Every operation runs in one critical
/// section, so multi-step flows and the liquidation health check cannot
/// interleave with other mutations.
#[derive(Debug)]
pub struct LoanSystem<A> {
    state: Mutex<State<A>>,
}

impl<A: CollateralAsset> LoanSystem<A> {
    pub fn provision(args: InitArg, asset: A) -> Result<Self, LoanError> {
        Ok(Self {
            state: Mutex::new(State::provision(args, asset)?),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, State<A>>, LoanError> {
        self.state
            .lock()
            .map_err(|_| LoanError::TemporarilyUnavailable("state lock is poisoned".to_string()))
    }

    /// Read (part of) the current state using `f`.
    pub fn read_state<F, R>(&self, f: F) -> Result<R, LoanError>
    where
        F: FnOnce(&State<A>) -> R,
    {
        let state = self.lock()?;
        Ok(f(&state))
    }

    /// Mutates (part of) the current state using `f`.
    ///
    /// With the `self_check` feature, panics if `f` leaves the state
    /// inconsistent.
    pub fn mutate_state<F, R>(&self, f: F) -> Result<R, LoanError>
    where
        F: FnOnce(&mut State<A>) -> R,
    {
        let mut state = self.lock()?;
        let result = f(&mut state);
        #[cfg(feature = "self_check")]
        check_postcondition(&state);
        Ok(result)
    }

    pub fn refs(&self) -> Result<SystemRefs, LoanError> {
        self.read_state(|s| s.refs())
    }

    pub fn deposit_collateral(
        &self,
        caller: Principal,
        amount: Collateral,
    ) -> Result<Credit, LoanError> {
        self.mutate_state(|s| s.deposit_collateral(caller, amount))?
    }

    pub fn unlock_collateral(
        &self,
        caller: Principal,
        credit: Credit,
    ) -> Result<Collateral, LoanError> {
        self.mutate_state(|s| s.unlock_collateral(caller, credit))?
    }

    pub fn liquidate(
        &self,
        caller: Principal,
        account: Principal,
    ) -> Result<LiquidationOutcome, LoanError> {
        self.mutate_state(|s| s.liquidate(caller, account))?
    }

    pub fn sweep_seized(
        &self,
        caller: Principal,
        to: Principal,
        amount: Collateral,
    ) -> Result<(), LoanError> {
        self.mutate_state(|s| s.sweep_seized(caller, to, amount))?
    }

    pub fn health_factor(&self, account: Principal) -> Result<Ratio, LoanError> {
        self.read_state(|s| s.health_factor(account))
    }

    pub fn check_positions(&self) -> Result<Vec<LiquidatablePosition>, LoanError> {
        self.read_state(|s| s.check_positions())
    }
}

#[cfg(feature = "self_check")]
fn check_postcondition<A: CollateralAsset>(state: &State<A>) {
    if let Err(msg) = state.check_invariants().and_then(|()| state.check_replay()) {
        panic!("invariant violation: {}", msg);
    }
}
