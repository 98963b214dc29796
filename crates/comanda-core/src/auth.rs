//! # Roles & Authorization
//!
//! Identity arrives already authenticated (cookie/JWT handling lives outside
//! this workspace). What stays here is the per-action matrix.
//!
//! ```text
//! ┌──────────────────────────┬───────┬─────────┬─────────┬────────┬─────────┐
//! │ Action                   │ admin │ manager │ cashier │ waiter │ kitchen │
//! ├──────────────────────────┼───────┼─────────┼─────────┼────────┼─────────┤
//! │ open/close table, items  │   ✓   │    ✓    │    ✓    │   ✓    │         │
//! │ close order              │   ✓   │    ✓    │    ✓    │   ✓    │         │
//! │ apply payment            │   ✓   │    ✓    │    ✓    │   ✓    │         │
//! │ reverse payment          │   ✓   │    ✓    │    ✓    │        │         │
//! │ cash session, outflows   │   ✓   │    ✓    │    ✓    │        │         │
//! │ force close, delete tbl  │   ✓   │    ✓    │         │        │         │
//! │ register/reserve table   │   ✓   │    ✓    │         │        │         │
//! │ reconcile                │   ✓   │    ✓    │         │        │         │
//! └──────────────────────────┴───────┴─────────┴─────────┴────────┴─────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};

// =============================================================================
// Role
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Cashier,
    Waiter,
    Kitchen,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Manager,
        Role::Cashier,
        Role::Waiter,
        Role::Kitchen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Cashier => "cashier",
            Role::Waiter => "waiter",
            Role::Kitchen => "kitchen",
        }
    }

    /// Admin or manager.
    pub fn is_supervisor(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == lowered)
            .ok_or_else(|| ValidationError::NotAllowed {
                field: "role".to_string(),
                allowed: Role::ALL.iter().map(|r| r.as_str().to_string()).collect(),
            })
    }
}

// =============================================================================
// Identity
// =============================================================================

/// The authenticated caller, as handed over by the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Identity {
            id: id.into(),
            name: name.into(),
            role,
        }
    }
}

// =============================================================================
// Action
// =============================================================================

/// Every gated operation in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    OpenTable,
    CloseTable,
    RegisterTable,
    ReserveTable,
    DeleteTable,
    ModifyOrder,
    CloseOrder,
    ForceCloseOrder,
    ApplyPayment,
    ReversePayment,
    OpenSession,
    CloseSession,
    RecordOutflow,
    Reconcile,
}

impl Action {
    /// Roles allowed to perform this action.
    pub fn allowed_roles(&self) -> &'static [Role] {
        use Role::*;
        match self {
            Action::OpenTable
            | Action::CloseTable
            | Action::ModifyOrder
            | Action::CloseOrder
            | Action::ApplyPayment => &[Admin, Manager, Cashier, Waiter],
            Action::ReversePayment
            | Action::OpenSession
            | Action::CloseSession
            | Action::RecordOutflow => &[Admin, Manager, Cashier],
            Action::ForceCloseOrder
            | Action::DeleteTable
            | Action::RegisterTable
            | Action::ReserveTable
            | Action::Reconcile => &[Admin, Manager],
        }
    }

    fn phrase(&self) -> &'static str {
        match self {
            Action::OpenTable => "open a table",
            Action::CloseTable => "close a table",
            Action::RegisterTable => "register a table",
            Action::ReserveTable => "reserve a table",
            Action::DeleteTable => "delete a table",
            Action::ModifyOrder => "modify an order",
            Action::CloseOrder => "close an order",
            Action::ForceCloseOrder => "force-close an order",
            Action::ApplyPayment => "apply a payment",
            Action::ReversePayment => "reverse a payment",
            Action::OpenSession => "open a cash session",
            Action::CloseSession => "close a cash session",
            Action::RecordOutflow => "record a cash outflow",
            Action::Reconcile => "reconcile discrepancies",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.phrase())
    }
}

/// Checks the matrix; `Forbidden` when the caller's role is not listed.
///
/// ## Example
/// ```rust
/// use comanda_core::auth::{authorize, Action, Identity, Role};
///
/// let waiter = Identity::new("u-1", "Ana", Role::Waiter);
/// assert!(authorize(&waiter, Action::ApplyPayment).is_ok());
/// assert!(authorize(&waiter, Action::OpenSession).is_err());
/// ```
pub fn authorize(identity: &Identity, action: Action) -> CoreResult<()> {
    if action.allowed_roles().contains(&identity.role) {
        Ok(())
    } else {
        Err(CoreError::Forbidden {
            role: identity.role,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn who(role: Role) -> Identity {
        Identity::new("u-1", "Someone", role)
    }

    #[test]
    fn test_role_round_trips_through_text() {
        for role in Role::ALL {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert_eq!(" Manager ".parse::<Role>().unwrap(), Role::Manager);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_session_actions_need_cash_role() {
        for action in [Action::OpenSession, Action::CloseSession, Action::RecordOutflow] {
            assert!(authorize(&who(Role::Admin), action).is_ok());
            assert!(authorize(&who(Role::Manager), action).is_ok());
            assert!(authorize(&who(Role::Cashier), action).is_ok());
            assert!(authorize(&who(Role::Waiter), action).is_err());
            assert!(authorize(&who(Role::Kitchen), action).is_err());
        }
    }

    #[test]
    fn test_force_close_is_supervisor_only() {
        assert!(authorize(&who(Role::Manager), Action::ForceCloseOrder).is_ok());
        let err = authorize(&who(Role::Cashier), Action::ForceCloseOrder).unwrap_err();
        assert_eq!(err.to_string(), "Role cashier may not force-close an order");
    }

    #[test]
    fn test_kitchen_cannot_touch_orders() {
        assert!(authorize(&who(Role::Kitchen), Action::ModifyOrder).is_err());
        assert!(authorize(&who(Role::Waiter), Action::ModifyOrder).is_ok());
    }
}
