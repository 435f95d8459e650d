//! Confidential token ledger seam.
//!
//! The engine escrows deposits and pays out allocations, refunds and proceeds
//! through [`ConfidentialLedger`]. Amounts are ciphertext handles; a failing
//! transfer must leave every balance untouched.

use std::collections::HashMap;

use clearing_fhe::{FheError, KeyHolder};
use clearing_types::{Address, EncryptedU64};
use thiserror::Error;
use tracing::debug;

/// Errors reported by a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Insufficient balance of token {token} for {owner}")]
    InsufficientBalance { token: String, owner: String },

    #[error("Insufficient allowance")]
    InsufficientAllowance,

    #[error("Balance overflow")]
    BalanceOverflow,

    #[error("Cannot resolve transfer amount: {0}")]
    Amount(#[from] FheError),
}

/// One leg of a multi-token payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub token: Address,
    pub to: Address,
    pub amount: EncryptedU64,
}

/// Transfer interface of a confidential token ledger.
pub trait ConfidentialLedger {
    /// Move `amount` of `token` from `from` to `to`, spending an allowance
    /// `from` granted to `spender`.
    fn transfer_from(
        &mut self,
        token: &Address,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: EncryptedU64,
    ) -> Result<(), LedgerError>;

    /// Execute every transfer out of `from`, or none of them.
    fn transfer_batch(&mut self, from: &Address, transfers: &[Transfer]) -> Result<(), LedgerError>;

    fn transfer(
        &mut self,
        token: &Address,
        from: &Address,
        to: &Address,
        amount: EncryptedU64,
    ) -> Result<(), LedgerError> {
        self.transfer_batch(
            from,
            &[Transfer {
                token: *token,
                to: *to,
                amount,
            }],
        )
    }
}

/// In-memory ledger for local runs and tests.
///
/// Balances are kept in the clear on the ledger's side. Transfer amounts
/// arrive encrypted and are resolved with the ledger's own key holder.
pub struct InMemoryLedger {
    key_holder: KeyHolder,
    /// (token, owner) -> balance
    balances: HashMap<(Address, Address), u64>,
    /// (token, owner, spender) -> remaining allowance
    allowances: HashMap<(Address, Address, Address), u64>,
}

impl InMemoryLedger {
    pub fn new(key_holder: KeyHolder) -> Self {
        Self {
            key_holder,
            balances: HashMap::new(),
            allowances: HashMap::new(),
        }
    }

    pub fn mint(&mut self, token: &Address, owner: &Address, amount: u64) {
        let balance = self.balances.entry((*token, *owner)).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    pub fn approve(&mut self, token: &Address, owner: &Address, spender: &Address, amount: u64) {
        self.allowances.insert((*token, *owner, *spender), amount);
    }

    pub fn balance_of(&self, token: &Address, owner: &Address) -> u64 {
        self.balances.get(&(*token, *owner)).copied().unwrap_or(0)
    }

    pub fn allowance(&self, token: &Address, owner: &Address, spender: &Address) -> u64 {
        self.allowances
            .get(&(*token, *owner, *spender))
            .copied()
            .unwrap_or(0)
    }

    /// Balances after applying `transfers`, without committing them.
    fn plan(
        &self,
        from: &Address,
        transfers: &[(Address, Address, u64)],
    ) -> Result<HashMap<(Address, Address), u64>, LedgerError> {
        let mut updated: HashMap<(Address, Address), u64> = HashMap::new();
        for (token, to, amount) in transfers {
            let source = *updated
                .entry((*token, *from))
                .or_insert_with(|| self.balance_of(token, from));
            let remaining =
                source
                    .checked_sub(*amount)
                    .ok_or_else(|| LedgerError::InsufficientBalance {
                        token: hex::encode(token),
                        owner: hex::encode(from),
                    })?;
            updated.insert((*token, *from), remaining);

            let target = *updated
                .entry((*token, *to))
                .or_insert_with(|| self.balance_of(token, to));
            let credited = target
                .checked_add(*amount)
                .ok_or(LedgerError::BalanceOverflow)?;
            updated.insert((*token, *to), credited);
        }
        Ok(updated)
    }
}

impl ConfidentialLedger for InMemoryLedger {
    fn transfer_from(
        &mut self,
        token: &Address,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: EncryptedU64,
    ) -> Result<(), LedgerError> {
        let value = self.key_holder.reveal_u64(amount)?;
        let allowance = self.allowance(token, from, spender);
        let remaining_allowance = allowance
            .checked_sub(value)
            .ok_or(LedgerError::InsufficientAllowance)?;

        let updated = self.plan(from, &[(*token, *to, value)])?;
        self.balances.extend(updated);
        self.allowances
            .insert((*token, *from, *spender), remaining_allowance);

        debug!(
            token = hex::encode(token),
            from = hex::encode(from),
            to = hex::encode(to),
            "Ledger transfer_from"
        );
        Ok(())
    }

    fn transfer_batch(&mut self, from: &Address, transfers: &[Transfer]) -> Result<(), LedgerError> {
        let resolved = transfers
            .iter()
            .map(|t| -> Result<_, LedgerError> {
                Ok((t.token, t.to, self.key_holder.reveal_u64(t.amount)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let updated = self.plan(from, &resolved)?;
        self.balances.extend(updated);

        debug!(
            from = hex::encode(from),
            legs = transfers.len(),
            "Ledger transfer batch"
        );
        Ok(())
    }
}
