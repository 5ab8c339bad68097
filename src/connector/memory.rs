//! Connector and wallet backed by in-process tables, for offline runs and tests.

use alloy_primitives::{Address, U256};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{BalanceTable, ChainConnector, ObserverSender, ObserverSlot};
use crate::contract_params::ParamEntry;
use crate::token::{PoolRef, TokenDescriptor};
use crate::transaction::TransactionEvent;
use crate::wallet::{PrivateKeyHandle, WalletProvider, WalletSnapshot};

#[derive(Default)]
struct ChainTables {
    tokens: Vec<TokenDescriptor>,
    init_params: HashMap<Address, Vec<ParamEntry>>,
    balance_tables: HashMap<Address, BalanceTable>,
    pools: HashMap<Address, PoolRef>,
    failing: HashSet<Address>,
    balance_reads: HashMap<Address, usize>,
}

#[derive(Default)]
pub struct InMemoryConnector {
    tables: Mutex<ChainTables>,
    observer: ObserverSlot,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        InMemoryConnector::default()
    }

    fn tables(&self) -> MutexGuard<'_, ChainTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_token(&self, descriptor: TokenDescriptor, init_params: Vec<ParamEntry>) {
        let mut tables = self.tables();
        tables.init_params.insert(descriptor.address, init_params);
        tables.tokens.push(descriptor);
    }

    pub fn set_balance(
        &self,
        token: Address,
        holder: impl Into<String>,
        amount: impl Into<String>,
    ) {
        self.tables()
            .balance_tables
            .entry(token)
            .or_default()
            .insert(holder.into(), amount.into());
    }

    pub fn set_pool(&self, token: Address, pool: PoolRef) {
        self.tables().pools.insert(token, pool);
    }

    /// Make every read for `token` fail until cleared.
    pub fn set_failing(&self, token: Address, failing: bool) {
        let mut tables = self.tables();
        if failing {
            tables.failing.insert(token);
        } else {
            tables.failing.remove(&token);
        }
    }

    /// How many times the balance table of `token` has been read.
    pub fn balance_reads(&self, token: &Address) -> usize {
        self.tables().balance_reads.get(token).copied().unwrap_or(0)
    }

    /// Push a transaction event to the registered observer.
    pub fn emit(&self, event: TransactionEvent) -> bool {
        self.observer.publish(event)
    }

    pub fn has_observer(&self) -> bool {
        self.observer.is_registered()
    }

    fn check(&self, token: Address) -> Result<()> {
        if self.tables().failing.contains(&token) {
            return Err(anyhow!("chain read failed for {token}"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainConnector for InMemoryConnector {
    async fn list_known_tokens(&self) -> Result<Vec<TokenDescriptor>> {
        Ok(self.tables().tokens.clone())
    }

    async fn get_pool_for(&self, token: Address) -> Result<Option<PoolRef>> {
        self.check(token)?;
        Ok(self.tables().pools.get(&token).cloned())
    }

    async fn get_init_params(&self, token: Address) -> Result<Vec<ParamEntry>> {
        self.check(token)?;
        self.tables()
            .init_params
            .get(&token)
            .cloned()
            .ok_or_else(|| anyhow!("{token} is not a deployed contract"))
    }

    async fn get_balance_table(&self, token: Address) -> Result<BalanceTable> {
        self.check(token)?;
        let mut tables = self.tables();
        *tables.balance_reads.entry(token).or_insert(0) += 1;
        Ok(tables.balance_tables.get(&token).cloned().unwrap_or_default())
    }

    fn register_transaction_observer(&self, observer: Option<ObserverSender>) {
        self.observer.replace(observer);
    }
}

/// Wallet whose balance is set by hand.
pub struct StaticWallet {
    address: Address,
    balance: Mutex<U256>,
    available: Mutex<bool>,
}

impl StaticWallet {
    pub fn new(address: Address, balance: U256) -> Self {
        StaticWallet {
            address,
            balance: Mutex::new(balance),
            available: Mutex::new(true),
        }
    }

    pub fn set_balance(&self, balance: U256) {
        *self.balance.lock().unwrap_or_else(PoisonError::into_inner) = balance;
    }

    /// Simulate the wallet backend being unreachable.
    pub fn set_available(&self, available: bool) {
        *self.available.lock().unwrap_or_else(PoisonError::into_inner) = available;
    }

    pub fn snapshot(&self, private_key: Option<PrivateKeyHandle>, network: &str) -> WalletSnapshot {
        WalletSnapshot {
            address: self.address,
            balance: *self.balance.lock().unwrap_or_else(PoisonError::into_inner),
            network: network.to_string(),
            private_key,
        }
    }
}

#[async_trait]
impl WalletProvider for StaticWallet {
    async fn reconnect(
        &self,
        private_key: &PrivateKeyHandle,
        network: &str,
    ) -> Result<WalletSnapshot> {
        if !*self.available.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(anyhow!("wallet backend unavailable"));
        }
        Ok(self.snapshot(Some(private_key.clone()), network))
    }
}
