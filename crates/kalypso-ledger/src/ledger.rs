use crate::error::{LedgerError, Result};
use crate::storage::{LedgerStorage, TransferRecord};
use chrono::Utc;
use kalypso_types::{Address, TokenAmount};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct TokenLedger {
    storage: Arc<dyn LedgerStorage>,
    // Serializes read-modify-write cycles across accounts.
    write_lock: Mutex<()>,
}

impl TokenLedger {
    pub fn new(storage: Arc<dyn LedgerStorage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn balance_of(&self, token: Address, account: Address) -> Result<TokenAmount> {
        self.storage.get_balance(token, account).await
    }

    /// Credit newly issued tokens. Used for funding accounts.
    pub async fn mint(&self, token: Address, to: Address, amount: TokenAmount) -> Result<()> {
        if to.is_zero() {
            return Err(LedgerError::ZeroAddress);
        }
        if amount.is_zero() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let current = self.storage.get_balance(token, to).await?;
        let updated = current
            .checked_add(amount)
            .ok_or(LedgerError::Overflow { account: to })?;
        self.storage.set_balance(token, to, updated).await?;
        info!(
            token = %token,
            account = %to,
            amount = %amount,
            balance_after = %updated,
            "💰 Tokens minted"
        );
        Ok(())
    }

    pub async fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: TokenAmount,
        memo: &str,
    ) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        if from == to {
            return Err(LedgerError::SelfTransfer(from));
        }
        if to.is_zero() {
            return Err(LedgerError::ZeroAddress);
        }

        let _guard = self.write_lock.lock().await;
        self.storage.begin_transaction().await?;
        match self.transfer_internal(token, from, to, amount).await {
            Ok(()) => {
                self.storage.commit_transaction().await?;
                let tx_hash = transfer_hash(token, from, to, amount);
                let record = TransferRecord {
                    token,
                    from,
                    to,
                    amount,
                    memo: memo.to_string(),
                    timestamp: Utc::now(),
                    tx_hash: tx_hash.clone(),
                };
                if let Err(e) = self.storage.record_transfer(record).await {
                    debug!(tx_hash = %tx_hash, error = %e, "Failed to record transfer");
                }
                info!(
                    token = %token,
                    from = %from,
                    to = %to,
                    amount = %amount,
                    memo,
                    "💸 Transfer committed"
                );
                Ok(())
            }
            Err(e) => {
                self.storage.rollback_transaction().await?;
                debug!(from = %from, to = %to, amount = %amount, error = %e, "❌ Transfer rolled back");
                Err(e)
            }
        }
    }

    async fn transfer_internal(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: TokenAmount,
    ) -> Result<()> {
        let from_balance = self.storage.get_balance(token, from).await?;
        let new_from = from_balance
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientBalance {
                token,
                account: from,
                available: from_balance,
                needed: amount,
            })?;
        let to_balance = self.storage.get_balance(token, to).await?;
        let new_to = to_balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow { account: to })?;
        self.storage.set_balance(token, from, new_from).await?;
        self.storage.set_balance(token, to, new_to).await?;
        Ok(())
    }

    pub async fn history(&self, account: Address) -> Result<Vec<TransferRecord>> {
        self.storage.transfer_history(account).await
    }
}

fn transfer_hash(token: Address, from: Address, to: Address, amount: TokenAmount) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(token.as_bytes());
    hasher.update(from.as_bytes());
    hasher.update(to.as_bytes());
    hasher.update(&amount.to_base_units().to_le_bytes());
    hasher.update(&Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hex::encode(hasher.finalize().as_bytes())
}
