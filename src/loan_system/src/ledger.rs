//! The credit token ledger: balances, allowances, capabilities and the pause gate.

use crate::event::{Event, EventLog};
use crate::numeric::{Credit, DECIMALS};
use crate::{LoanError, INFO};
use candid::{CandidType, Principal};
use ic_canister_log::log;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(
    CandidType, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Role {
    #[serde(rename = "minter")]
    Minter,
    #[serde(rename = "pauser")]
    Pauser,
    #[serde(rename = "admin")]
    Admin,
}

#[derive(Clone, Debug)]
pub struct CreditLedger {
    pub(crate) principal: Principal,
    pub(crate) name: String,
    pub(crate) symbol: String,
    pub(crate) balances: BTreeMap<Principal, Credit>,
    pub(crate) allowances: BTreeMap<(Principal, Principal), Credit>,
    pub(crate) total_supply: Credit,
    pub(crate) roles: BTreeMap<Role, BTreeSet<Principal>>,
    pub(crate) paused: bool,
    pub(crate) events: EventLog,
}

/// Saved values of the entries an operation is about to touch.
#[derive(Clone, Debug)]
pub struct LedgerCheckpoint {
    balances: Vec<(Principal, Option<Credit>)>,
    allowances: Vec<((Principal, Principal), Option<Credit>)>,
    total_supply: Credit,
    events_len: usize,
}

impl CreditLedger {
    pub(crate) fn empty(principal: Principal, name: String, symbol: String) -> Self {
        Self {
            principal,
            name,
            symbol,
            balances: BTreeMap::new(),
            allowances: BTreeMap::new(),
            total_supply: Credit::ZERO,
            roles: BTreeMap::new(),
            paused: false,
            events: EventLog::default(),
        }
    }

    /// Creates a ledger whose `admin` holds every capability. A non-zero
    /// `initial_reserve` is minted to the ledger's own account.
    pub fn new(
        principal: Principal,
        admin: Principal,
        name: String,
        symbol: String,
        initial_reserve: Credit,
    ) -> Result<Self, LoanError> {
        let mut ledger = Self::empty(principal, name.clone(), symbol.clone());
        ledger.events.record(&Event::LedgerInit {
            ledger: principal,
            name,
            symbol,
        });
        for role in [Role::Admin, Role::Minter, Role::Pauser] {
            ledger.record_role(role, admin, admin, true);
        }
        if !initial_reserve.is_zero() {
            ledger.apply_transfer(None, Some(principal), initial_reserve, None)?;
            ledger.events.record(&Event::Transfer {
                from: None,
                to: Some(principal),
                amount: initial_reserve,
                spender: None,
            });
        }
        Ok(ledger)
    }

    pub fn principal(&self) -> Principal {
        self.principal
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn decimals(&self) -> u8 {
        DECIMALS as u8
    }

    pub fn balance_of(&self, account: Principal) -> Credit {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    pub fn balances(&self) -> impl Iterator<Item = (&Principal, &Credit)> {
        self.balances.iter()
    }

    pub fn total_supply(&self) -> Credit {
        self.total_supply
    }

    pub fn allowance(&self, owner: Principal, spender: Principal) -> Credit {
        self.allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_role(&self, role: Role, account: Principal) -> bool {
        self.roles
            .get(&role)
            .is_some_and(|holders| holders.contains(&account))
    }

    pub fn holds_any_role(&self, account: Principal) -> bool {
        self.roles.values().any(|holders| holders.contains(&account))
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    fn require_any_role(
        &self,
        caller: Principal,
        roles: &[Role],
        message: &str,
    ) -> Result<(), LoanError> {
        if roles.iter().any(|role| self.has_role(*role, caller)) {
            Ok(())
        } else {
            Err(LoanError::Unauthorized(message.to_string()))
        }
    }

    fn require_not_paused(&self) -> Result<(), LoanError> {
        if self.paused {
            return Err(LoanError::LedgerPaused);
        }
        Ok(())
    }

    pub fn mint(&mut self, caller: Principal, to: Principal, amount: Credit) -> Result<(), LoanError> {
        self.require_any_role(caller, &[Role::Minter, Role::Admin], "No minter or admin role")?;
        self.require_not_paused()?;
        self.record_transfer(None, Some(to), amount, None)?;
        log!(INFO, "[mint] {} minted {} to {}", caller, amount, to);
        Ok(())
    }

    /// Destroys `amount` of `from`'s credit. A caller other than `from`
    /// spends its allowance.
    pub fn burn_from(
        &mut self,
        caller: Principal,
        from: Principal,
        amount: Credit,
    ) -> Result<(), LoanError> {
        self.require_not_paused()?;
        let spender = (caller != from).then_some(caller);
        self.record_transfer(Some(from), None, amount, spender)?;
        log!(INFO, "[burn_from] {} burned {} from {}", caller, amount, from);
        Ok(())
    }

    /// Writes off `amount` of `from`'s credit without an allowance.
    pub fn burn(&mut self, caller: Principal, from: Principal, amount: Credit) -> Result<(), LoanError> {
        self.require_any_role(caller, &[Role::Minter, Role::Admin], "No minter or admin role")?;
        self.require_not_paused()?;
        self.record_transfer(Some(from), None, amount, None)?;
        log!(INFO, "[burn] {} wrote off {} of {}", caller, amount, from);
        Ok(())
    }

    pub fn transfer(&mut self, caller: Principal, to: Principal, amount: Credit) -> Result<(), LoanError> {
        self.require_not_paused()?;
        self.record_transfer(Some(caller), Some(to), amount, None)?;
        log!(INFO, "[transfer] {} sent {} to {}", caller, amount, to);
        Ok(())
    }

    pub fn transfer_from(
        &mut self,
        caller: Principal,
        from: Principal,
        to: Principal,
        amount: Credit,
    ) -> Result<(), LoanError> {
        self.require_not_paused()?;
        self.record_transfer(Some(from), Some(to), amount, Some(caller))?;
        log!(
            INFO,
            "[transfer_from] {} moved {} from {} to {}",
            caller,
            amount,
            from,
            to
        );
        Ok(())
    }

    /// Sets the allowance of `spender` over `caller`'s balance. Allowed while paused.
    pub fn approve(&mut self, caller: Principal, spender: Principal, amount: Credit) {
        self.record_approval(caller, spender, amount);
        log!(INFO, "[approve] {} allowed {} to spend {}", caller, spender, amount);
    }

    /// Lets `spender` draw on the reserve held by the ledger's own account.
    pub fn approve_reserve(
        &mut self,
        caller: Principal,
        spender: Principal,
        amount: Credit,
    ) -> Result<(), LoanError> {
        self.require_any_role(caller, &[Role::Admin], "No admin role")?;
        self.record_approval(self.principal, spender, amount);
        log!(INFO, "[approve_reserve] {} may spend {} of the reserve", spender, amount);
        Ok(())
    }

    /// Pausing an already paused ledger succeeds and emits another record.
    pub fn pause(&mut self, caller: Principal) -> Result<(), LoanError> {
        self.require_any_role(caller, &[Role::Pauser, Role::Admin], "No pauser or admin role")?;
        self.apply_pause(true);
        self.events.record(&Event::LedgerPaused { by: caller });
        log!(INFO, "[pause] ledger paused by {}", caller);
        Ok(())
    }

    pub fn unpause(&mut self, caller: Principal) -> Result<(), LoanError> {
        self.require_any_role(caller, &[Role::Pauser, Role::Admin], "No pauser or admin role")?;
        self.apply_pause(false);
        self.events.record(&Event::LedgerUnpaused { by: caller });
        log!(INFO, "[unpause] ledger unpaused by {}", caller);
        Ok(())
    }

    pub fn grant_role(
        &mut self,
        caller: Principal,
        role: Role,
        account: Principal,
    ) -> Result<(), LoanError> {
        self.require_any_role(caller, &[Role::Admin], "No admin role")?;
        if self.record_role(role, account, caller, true) {
            log!(INFO, "[grant_role] {} granted {:?} to {}", caller, role, account);
        }
        Ok(())
    }

    pub fn revoke_role(
        &mut self,
        caller: Principal,
        role: Role,
        account: Principal,
    ) -> Result<(), LoanError> {
        self.require_any_role(caller, &[Role::Admin], "No admin role")?;
        if self.record_role(role, account, caller, false) {
            log!(INFO, "[revoke_role] {} revoked {:?} from {}", caller, role, account);
        }
        Ok(())
    }

    fn record_transfer(
        &mut self,
        from: Option<Principal>,
        to: Option<Principal>,
        amount: Credit,
        spender: Option<Principal>,
    ) -> Result<(), LoanError> {
        self.apply_transfer(from, to, amount, spender)?;
        self.events.record(&Event::Transfer {
            from,
            to,
            amount,
            spender,
        });
        Ok(())
    }

    fn record_approval(&mut self, owner: Principal, spender: Principal, amount: Credit) {
        self.apply_approval(owner, spender, amount);
        self.events.record(&Event::Approval {
            owner,
            spender,
            amount,
        });
    }

    /// Returns whether the capability set changed. Unchanged sets emit nothing.
    fn record_role(&mut self, role: Role, account: Principal, by: Principal, grant: bool) -> bool {
        if self.has_role(role, account) == grant {
            return false;
        }
        self.apply_role(role, account, grant);
        let event = if grant {
            Event::RoleGranted { role, account, by }
        } else {
            Event::RoleRevoked { role, account, by }
        };
        self.events.record(&event);
        true
    }

    /// Moves `amount` between accounts; a missing `from` mints and a missing
    /// `to` burns. Either every check passes and all entries change, or
    /// nothing changes.
    pub(crate) fn apply_transfer(
        &mut self,
        from: Option<Principal>,
        to: Option<Principal>,
        amount: Credit,
        spender: Option<Principal>,
    ) -> Result<(), LoanError> {
        let spent_allowance = match (from, spender) {
            (Some(owner), Some(spender)) => {
                let allowance = self.allowance(owner, spender);
                let left = allowance
                    .checked_sub(amount)
                    .ok_or(LoanError::InsufficientAllowance {
                        allowance,
                        required: amount,
                    })?;
                Some(((owner, spender), left))
            }
            _ => None,
        };

        let debited = match from {
            Some(owner) => {
                let balance = self.balance_of(owner);
                let left = balance
                    .checked_sub(amount)
                    .ok_or(LoanError::InsufficientBalance {
                        balance,
                        required: amount,
                    })?;
                Some((owner, left))
            }
            None => None,
        };

        let credited = match to {
            Some(receiver) => {
                let current = match debited {
                    Some((owner, left)) if owner == receiver => left,
                    _ => self.balance_of(receiver),
                };
                let updated = current
                    .checked_add(amount)
                    .ok_or(LoanError::ArithmeticOverflow)?;
                Some((receiver, updated))
            }
            None => None,
        };

        let total_supply = match (from, to) {
            (None, Some(_)) => self
                .total_supply
                .checked_add(amount)
                .ok_or(LoanError::ArithmeticOverflow)?,
            (Some(_), None) => self
                .total_supply
                .checked_sub(amount)
                .ok_or(LoanError::ArithmeticOverflow)?,
            (Some(_), Some(_)) => self.total_supply,
            (None, None) => {
                return Err(LoanError::InvalidConfiguration(
                    "a transfer needs at least one account".to_string(),
                ))
            }
        };

        if let Some((key, left)) = spent_allowance {
            self.allowances.insert(key, left);
        }
        if let Some((owner, left)) = debited {
            self.balances.insert(owner, left);
        }
        if let Some((receiver, updated)) = credited {
            self.balances.insert(receiver, updated);
        }
        self.total_supply = total_supply;
        Ok(())
    }

    pub(crate) fn apply_approval(&mut self, owner: Principal, spender: Principal, amount: Credit) {
        self.allowances.insert((owner, spender), amount);
    }

    pub(crate) fn apply_role(&mut self, role: Role, account: Principal, grant: bool) {
        if grant {
            self.roles.entry(role).or_default().insert(account);
        } else if let Some(holders) = self.roles.get_mut(&role) {
            holders.remove(&account);
            if holders.is_empty() {
                self.roles.remove(&role);
            }
        }
    }

    pub(crate) fn apply_pause(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn checkpoint(
        &self,
        accounts: &[Principal],
        allowances: &[(Principal, Principal)],
    ) -> LedgerCheckpoint {
        LedgerCheckpoint {
            balances: accounts
                .iter()
                .map(|account| (*account, self.balances.get(account).copied()))
                .collect(),
            allowances: allowances
                .iter()
                .map(|key| (*key, self.allowances.get(key).copied()))
                .collect(),
            total_supply: self.total_supply,
            events_len: self.events.len(),
        }
    }

    pub fn rollback(&mut self, checkpoint: LedgerCheckpoint) {
        for (account, saved) in checkpoint.balances {
            match saved {
                Some(balance) => self.balances.insert(account, balance),
                None => self.balances.remove(&account),
            };
        }
        for (key, saved) in checkpoint.allowances {
            match saved {
                Some(allowance) => self.allowances.insert(key, allowance),
                None => self.allowances.remove(&key),
            };
        }
        self.total_supply = checkpoint.total_supply;
        self.events.truncate(checkpoint.events_len);
    }

    pub fn check_semantically_eq(&self, other: &Self) -> Result<(), String> {
        ensure_eq!(self.principal, other.principal, "ledger principal does not match");
        ensure_eq!(self.name, other.name, "name does not match");
        ensure_eq!(self.symbol, other.symbol, "symbol does not match");
        ensure_eq!(self.balances, other.balances, "balances do not match");
        ensure_eq!(self.allowances, other.allowances, "allowances do not match");
        ensure_eq!(self.total_supply, other.total_supply, "total_supply does not match");
        ensure_eq!(self.roles, other.roles, "roles do not match");
        ensure_eq!(self.paused, other.paused, "paused flag does not match");
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        let sum = self
            .balances
            .values()
            .try_fold(Credit::ZERO, |acc, b| acc.checked_add(*b));
        ensure!(
            sum == Some(self.total_supply),
            "total supply {} differs from the sum of balances {:?}",
            self.total_supply,
            sum
        );
        Ok(())
    }
}
