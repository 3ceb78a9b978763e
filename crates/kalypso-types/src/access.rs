//! Role-based authorization policy.
//!
//! Every privileged entry point calls [`AccessControl::ensure`] with the
//! caller's address before touching state.

use crate::address::Address;
use crate::error::AccessError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Grants and revokes every other role.
    Admin,
    /// May mutate enclave key slots and image families.
    KeyRegister,
    /// May assign bids to provers.
    MatchingEngine,
    /// Held by the staking manager; pools accept lock/unlock/slash only from it.
    StakingManager,
    /// Held by the marketplace; the manager and prover registry accept task
    /// lifecycle calls only from it.
    Marketplace,
    /// May change protocol parameters (weights, cooldowns, commission).
    Updater,
}

pub struct AccessControl {
    members: RwLock<HashMap<Role, HashSet<Address>>>,
}

impl AccessControl {
    pub fn new(admin: Address) -> Self {
        let mut members: HashMap<Role, HashSet<Address>> = HashMap::new();
        members.entry(Role::Admin).or_default().insert(admin);
        Self {
            members: RwLock::new(members),
        }
    }

    pub async fn has_role(&self, role: Role, account: Address) -> bool {
        let members = self.members.read().await;
        members
            .get(&role)
            .map(|set| set.contains(&account))
            .unwrap_or(false)
    }

    pub async fn ensure(&self, role: Role, account: Address) -> Result<(), AccessError> {
        if self.has_role(role, account).await {
            Ok(())
        } else {
            Err(AccessError::MissingRole { role, account })
        }
    }

    /// Passes if the account holds any of `roles`; reports the first one otherwise.
    pub async fn ensure_any(&self, roles: &[Role], account: Address) -> Result<(), AccessError> {
        for role in roles {
            if self.has_role(*role, account).await {
                return Ok(());
            }
        }
        Err(AccessError::MissingRole {
            role: roles.first().copied().unwrap_or(Role::Admin),
            account,
        })
    }

    pub async fn grant_role(
        &self,
        caller: Address,
        role: Role,
        account: Address,
    ) -> Result<(), AccessError> {
        self.ensure(Role::Admin, caller).await?;
        if account.is_zero() {
            return Err(AccessError::ZeroAddress);
        }
        let mut members = self.members.write().await;
        if members.entry(role).or_default().insert(account) {
            info!(role = ?role, account = %account, "🔑 Role granted");
        }
        Ok(())
    }

    pub async fn revoke_role(
        &self,
        caller: Address,
        role: Role,
        account: Address,
    ) -> Result<(), AccessError> {
        self.ensure(Role::Admin, caller).await?;
        let mut members = self.members.write().await;
        if let Some(set) = members.get_mut(&role) {
            if set.remove(&account) {
                info!(role = ?role, account = %account, "🔒 Role revoked");
            }
        }
        Ok(())
    }

    pub async fn members_of(&self, role: Role) -> Vec<Address> {
        let members = self.members.read().await;
        let mut out: Vec<Address> = members
            .get(&role)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        out.sort();
        out
    }
}
