//! Plugin notification hooks.
//!
//! External plugins observe account lifecycle changes. Delivery (RPC or
//! otherwise) is a collaborator concern; the default hook logs.

use crate::store::types::User;
use tracing::debug;

/// What happened to the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountAction {
    Create,
    Update,
    Delete,
}

impl AccountAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountAction::Create => "create",
            AccountAction::Update => "update",
            AccountAction::Delete => "delete",
        }
    }
}

/// Observer of account lifecycle changes.
pub trait AccountHook: Send + Sync {
    fn account(&self, user: &User, action: AccountAction);
}

/// Default hook: logs the change.
pub struct LogAccountHook;

impl AccountHook for LogAccountHook {
    fn account(&self, user: &User, action: AccountAction) {
        debug!(user = %user.id.user_id(), action = %action.as_str(), "account plugin hook");
    }
}
