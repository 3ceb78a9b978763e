use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kalypso_types::{Address, TokenAmount};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub amount: TokenAmount,
    pub memo: String,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: String,
}

type BalanceMap = HashMap<(Address, Address), TokenAmount>;

#[async_trait]
pub trait LedgerStorage: Send + Sync {
    async fn get_balance(&self, token: Address, account: Address) -> Result<TokenAmount>;
    async fn set_balance(&self, token: Address, account: Address, balance: TokenAmount)
        -> Result<()>;

    async fn begin_transaction(&self) -> Result<()>;
    async fn commit_transaction(&self) -> Result<()>;
    async fn rollback_transaction(&self) -> Result<()>;

    async fn record_transfer(&self, record: TransferRecord) -> Result<()>;
    async fn transfer_history(&self, account: Address) -> Result<Vec<TransferRecord>>;
}

/// In-memory backend. A transaction snapshots the balance map and restores
/// it on rollback.
#[derive(Default)]
pub struct MemoryStorage {
    balances: RwLock<BalanceMap>,
    backup: RwLock<Option<BalanceMap>>,
    history: RwLock<Vec<TransferRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    async fn get_balance(&self, token: Address, account: Address) -> Result<TokenAmount> {
        let balances = self.balances.read().await;
        Ok(balances
            .get(&(token, account))
            .copied()
            .unwrap_or(TokenAmount::ZERO))
    }

    async fn set_balance(
        &self,
        token: Address,
        account: Address,
        balance: TokenAmount,
    ) -> Result<()> {
        let mut balances = self.balances.write().await;
        if balance.is_zero() {
            balances.remove(&(token, account));
        } else {
            balances.insert((token, account), balance);
        }
        debug!(
            token = %token,
            account = %account,
            balance = %balance,
            storage_type = "memory",
            "💾 Balance stored"
        );
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let balances = self.balances.read().await;
        let mut backup = self.backup.write().await;
        *backup = Some(balances.clone());
        debug!(accounts = balances.len(), "📝 Transaction began");
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let mut backup = self.backup.write().await;
        *backup = None;
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let mut backup = self.backup.write().await;
        if let Some(saved) = backup.take() {
            let mut balances = self.balances.write().await;
            *balances = saved;
            info!(storage_type = "memory", "❌ Transaction rolled back");
        }
        Ok(())
    }

    async fn record_transfer(&self, record: TransferRecord) -> Result<()> {
        let mut history = self.history.write().await;
        history.push(record);
        Ok(())
    }

    async fn transfer_history(&self, account: Address) -> Result<Vec<TransferRecord>> {
        let history = self.history.read().await;
        Ok(history
            .iter()
            .filter(|r| r.from == account || r.to == account)
            .cloned()
            .collect())
    }
}
