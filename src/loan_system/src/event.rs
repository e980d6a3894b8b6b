use crate::custodian::CollateralCustodian;
use crate::ledger::{CreditLedger, Role};
use crate::numeric::{Collateral, Credit, Rate, Ratio};
use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};

/// Notification records emitted by the three components.
///
/// Ledger and custodian records are complete: replaying them rebuilds the
/// component. Orchestrator records document the user-facing flows.
#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "ledger_init")]
    LedgerInit {
        ledger: Principal,
        name: String,
        symbol: String,
    },

    /// A mint when `from` is absent, a burn when `to` is absent.
    #[serde(rename = "transfer")]
    Transfer {
        from: Option<Principal>,
        to: Option<Principal>,
        amount: Credit,
        /// Set when the movement consumed an allowance of `from`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spender: Option<Principal>,
    },

    #[serde(rename = "approval")]
    Approval {
        owner: Principal,
        spender: Principal,
        amount: Credit,
    },

    #[serde(rename = "role_granted")]
    RoleGranted {
        role: Role,
        account: Principal,
        by: Principal,
    },

    #[serde(rename = "role_revoked")]
    RoleRevoked {
        role: Role,
        account: Principal,
        by: Principal,
    },

    #[serde(rename = "ledger_paused")]
    LedgerPaused { by: Principal },

    #[serde(rename = "ledger_unpaused")]
    LedgerUnpaused { by: Principal },

    #[serde(rename = "custodian_init")]
    CustodianInit {
        custodian: Principal,
        admin: Principal,
        price_per_unit: Rate,
        liquidation_threshold: Ratio,
    },

    #[serde(rename = "orchestrator_authorized")]
    OrchestratorAuthorized {
        orchestrator: Principal,
        by: Principal,
    },

    #[serde(rename = "collateral_recorded")]
    CollateralRecorded {
        account: Principal,
        amount: Collateral,
    },

    #[serde(rename = "collateral_released")]
    CollateralReleased {
        account: Principal,
        amount: Collateral,
    },

    #[serde(rename = "liquidated")]
    Liquidated {
        account: Principal,
        seized_amount: Collateral,
        health_factor: Ratio,
    },

    #[serde(rename = "seized_swept")]
    SeizedSwept {
        to: Principal,
        amount: Collateral,
        by: Principal,
    },

    #[serde(rename = "deposit_recorded")]
    DepositRecorded {
        account: Principal,
        custodian: Principal,
        amount: Collateral,
    },

    #[serde(rename = "credit_minted")]
    CreditMinted {
        ledger: Principal,
        account: Principal,
        amount: Credit,
    },

    #[serde(rename = "credit_burned_or_returned")]
    CreditBurnedOrReturned {
        account: Principal,
        ledger: Principal,
        amount: Credit,
    },

    #[serde(rename = "collateral_decreased")]
    CollateralDecreased {
        account: Principal,
        amount: Collateral,
    },

    #[serde(rename = "position_liquidated")]
    PositionLiquidated {
        account: Principal,
        seized_amount: Collateral,
        debt_burned: Credit,
        liquidator: Principal,
    },
}

impl Event {
    pub fn is_account_related(&self, filter: &Principal) -> bool {
        match self {
            Event::LedgerInit { .. } => false,
            Event::Transfer {
                from, to, spender, ..
            } => {
                from.as_ref() == Some(filter)
                    || to.as_ref() == Some(filter)
                    || spender.as_ref() == Some(filter)
            }
            Event::Approval { owner, spender, .. } => owner == filter || spender == filter,
            Event::RoleGranted { account, .. } => account == filter,
            Event::RoleRevoked { account, .. } => account == filter,
            Event::LedgerPaused { .. } => false,
            Event::LedgerUnpaused { .. } => false,
            Event::CustodianInit { .. } => false,
            Event::OrchestratorAuthorized { .. } => false,
            Event::CollateralRecorded { account, .. } => account == filter,
            Event::CollateralReleased { account, .. } => account == filter,
            Event::Liquidated { account, .. } => account == filter,
            Event::SeizedSwept { to, .. } => to == filter,
            Event::DepositRecorded { account, .. } => account == filter,
            Event::CreditMinted { account, .. } => account == filter,
            Event::CreditBurnedOrReturned { account, .. } => account == filter,
            Event::CollateralDecreased { account, .. } => account == filter,
            Event::PositionLiquidated {
                account,
                liquidator,
                ..
            } => account == filter || liquidator == filter,
        }
    }
}

/// Append-only log of CBOR-encoded events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventLog {
    records: Vec<Vec<u8>>,
}

impl EventLog {
    pub fn record(&mut self, event: &Event) {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(event, &mut buf).expect("failed to encode an event");
        self.records.push(buf);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Event> {
        self.records.get(index).map(|bytes| decode_event(bytes))
    }

    /// The encoded record as external watchers receive it.
    pub fn encoded(&self, index: usize) -> Option<&[u8]> {
        self.records.get(index).map(Vec::as_slice)
    }

    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.records.iter().map(|bytes| decode_event(bytes))
    }

    pub fn last(&self) -> Option<Event> {
        self.records.last().map(|bytes| decode_event(bytes))
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }
}

fn decode_event(bytes: &[u8]) -> Event {
    ciborium::de::from_reader(bytes).expect("failed to decode an event")
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReplayLogError {
    /// There are no events in the event log.
    EmptyLog,
    /// The event log is inconsistent.
    InconsistentLog(String),
}

pub fn replay_ledger(mut events: impl Iterator<Item = Event>) -> Result<CreditLedger, ReplayLogError> {
    let init = events.next().ok_or(ReplayLogError::EmptyLog)?;
    let mut ledger = match &init {
        Event::LedgerInit {
            ledger,
            name,
            symbol,
        } => CreditLedger::empty(*ledger, name.clone(), symbol.clone()),
        other => {
            return Err(ReplayLogError::InconsistentLog(format!(
                "The first event is not LedgerInit: {:?}",
                other
            )))
        }
    };
    ledger.events.record(&init);
    for event in events {
        let applied = match &event {
            Event::Transfer {
                from,
                to,
                amount,
                spender,
            } => ledger.apply_transfer(*from, *to, *amount, *spender),
            Event::Approval {
                owner,
                spender,
                amount,
            } => {
                ledger.apply_approval(*owner, *spender, *amount);
                Ok(())
            }
            Event::RoleGranted { role, account, .. } => {
                ledger.apply_role(*role, *account, true);
                Ok(())
            }
            Event::RoleRevoked { role, account, .. } => {
                ledger.apply_role(*role, *account, false);
                Ok(())
            }
            Event::LedgerPaused { .. } => {
                ledger.apply_pause(true);
                Ok(())
            }
            Event::LedgerUnpaused { .. } => {
                ledger.apply_pause(false);
                Ok(())
            }
            Event::LedgerInit { .. } => {
                return Err(ReplayLogError::InconsistentLog(
                    "should have only one init event".to_string(),
                ))
            }
            other => {
                return Err(ReplayLogError::InconsistentLog(format!(
                    "unexpected event in a ledger log: {:?}",
                    other
                )))
            }
        };
        applied.map_err(|e| {
            ReplayLogError::InconsistentLog(format!("failed to apply {:?}: {}", event, e))
        })?;
        ledger.events.record(&event);
    }
    Ok(ledger)
}

pub fn replay_custodian(
    mut events: impl Iterator<Item = Event>,
) -> Result<CollateralCustodian, ReplayLogError> {
    let init = events.next().ok_or(ReplayLogError::EmptyLog)?;
    let mut custodian = match &init {
        Event::CustodianInit {
            custodian,
            admin,
            price_per_unit,
            liquidation_threshold,
        } => CollateralCustodian::empty(
            *custodian,
            *admin,
            *price_per_unit,
            *liquidation_threshold,
        ),
        other => {
            return Err(ReplayLogError::InconsistentLog(format!(
                "The first event is not CustodianInit: {:?}",
                other
            )))
        }
    };
    custodian.events.record(&init);
    for event in events {
        let applied = match &event {
            Event::OrchestratorAuthorized { orchestrator, .. } => {
                custodian.apply_authorization(*orchestrator);
                Ok(())
            }
            Event::CollateralRecorded { account, amount } => {
                custodian.apply_deposit(*account, *amount)
            }
            Event::CollateralReleased { account, amount } => {
                custodian.apply_withdrawal(*account, *amount)
            }
            Event::Liquidated {
                account,
                seized_amount,
                ..
            } => custodian.apply_liquidation(*account, *seized_amount),
            Event::SeizedSwept { amount, .. } => custodian.apply_sweep(*amount),
            Event::CustodianInit { .. } => {
                return Err(ReplayLogError::InconsistentLog(
                    "should have only one init event".to_string(),
                ))
            }
            other => {
                return Err(ReplayLogError::InconsistentLog(format!(
                    "unexpected event in a custodian log: {:?}",
                    other
                )))
            }
        };
        applied.map_err(|e| {
            ReplayLogError::InconsistentLog(format!("failed to apply {:?}: {}", event, e))
        })?;
        custodian.events.record(&event);
    }
    Ok(custodian)
}
