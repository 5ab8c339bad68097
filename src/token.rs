//! Token records as held in the store, and the conversions that create them.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::wallet::WalletSnapshot;

/// Reserved address of the native-currency pseudo-token.
pub const NATIVE_CURRENCY_ADDRESS: Address = Address::ZERO;

/// Token as advertised by the chain connector before any on-chain read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDescriptor {
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
}

/// Reference to the liquidity pool trading a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRef {
    pub address: Address,
    pub quote_token: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub address: Address,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub total_supply: U256,
    pub own_balance: U256,
    pub balances_by_owner: BTreeMap<Address, U256>,
    pub is_native_currency: bool,
    pub initialized: bool,
    pub dirty: bool,
    pub loading: bool,
    pub list_priority: Option<u32>,
    pub pool: Option<PoolRef>,
}

impl TokenRecord {
    /// Fresh, uninitialized record for a contract-backed token.
    pub fn from_descriptor(descriptor: &TokenDescriptor) -> Self {
        TokenRecord {
            address: descriptor.address,
            symbol: descriptor.symbol.clone(),
            name: String::new(),
            decimals: descriptor.decimals,
            total_supply: U256::ZERO,
            own_balance: U256::ZERO,
            balances_by_owner: BTreeMap::new(),
            is_native_currency: false,
            initialized: false,
            dirty: false,
            loading: false,
            list_priority: None,
            pool: None,
        }
    }

    /// Record for an address first seen through a patch.
    pub fn placeholder(address: Address) -> Self {
        TokenRecord::from_descriptor(&TokenDescriptor {
            address,
            decimals: 0,
            symbol: String::new(),
        })
    }

    /// Pseudo-token for the chain's native currency, seeded from the wallet.
    pub fn native(currency: &NativeCurrency, wallet: &WalletSnapshot) -> Self {
        let mut balances_by_owner = BTreeMap::new();
        balances_by_owner.insert(wallet.address, wallet.balance);

        TokenRecord {
            address: NATIVE_CURRENCY_ADDRESS,
            symbol: currency.symbol.clone(),
            name: currency.name.clone(),
            decimals: currency.decimals,
            total_supply: U256::ZERO,
            own_balance: wallet.balance,
            balances_by_owner,
            is_native_currency: true,
            initialized: true,
            dirty: false,
            loading: false,
            list_priority: Some(0),
            pool: None,
        }
    }

    /// True when the cached state must be fetched again.
    pub fn is_stale(&self) -> bool {
        !(self.initialized && !self.dirty)
    }

    pub fn balance_of(&self, owner: &Address) -> U256 {
        self.balances_by_owner
            .get(owner)
            .copied()
            .unwrap_or(U256::ZERO)
    }
}

/// Display metadata for the native currency pseudo-token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCurrency {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

impl Default for NativeCurrency {
    fn default() -> Self {
        NativeCurrency {
            symbol: "ETH".to_string(),
            name: "Ether".to_string(),
            decimals: 18,
        }
    }
}

/// Partial update merged into the record stored under `address`.
///
/// `None` fields leave the stored value untouched, so concurrent writers only
/// overwrite what they actually computed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPatch {
    pub address: Address,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: Option<u8>,
    pub total_supply: Option<U256>,
    pub own_balance: Option<U256>,
    pub balances_by_owner: Option<BTreeMap<Address, U256>>,
    pub pool: Option<Option<PoolRef>>,
    pub initialized: Option<bool>,
    pub dirty: Option<bool>,
    pub loading: Option<bool>,
}

impl TokenPatch {
    pub fn new(address: Address) -> Self {
        TokenPatch {
            address,
            ..Default::default()
        }
    }

    /// Flag flip applied before a refresh task is spawned.
    pub fn begin_refresh(address: Address) -> Self {
        TokenPatch {
            loading: Some(true),
            dirty: Some(false),
            initialized: Some(true),
            ..TokenPatch::new(address)
        }
    }

    /// Clears `loading` after a failed refresh, leaving `dirty`/`initialized` alone.
    pub fn refresh_failed(address: Address) -> Self {
        TokenPatch {
            loading: Some(false),
            ..TokenPatch::new(address)
        }
    }

    /// Merge of a refreshed record.
    ///
    /// `dirty` is not carried over: an invalidation that arrived while the
    /// refresh was in flight must survive it.
    pub fn refreshed(record: TokenRecord) -> Self {
        TokenPatch {
            address: record.address,
            symbol: Some(record.symbol),
            name: Some(record.name),
            decimals: Some(record.decimals),
            total_supply: Some(record.total_supply),
            own_balance: Some(record.own_balance),
            balances_by_owner: Some(record.balances_by_owner),
            pool: Some(record.pool),
            initialized: Some(record.initialized),
            dirty: None,
            loading: Some(record.loading),
        }
    }

    pub fn apply_to(self, record: &mut TokenRecord) {
        if let Some(symbol) = self.symbol {
            record.symbol = symbol;
        }
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(decimals) = self.decimals {
            record.decimals = decimals;
        }
        if let Some(total_supply) = self.total_supply {
            record.total_supply = total_supply;
        }
        if let Some(own_balance) = self.own_balance {
            record.own_balance = own_balance;
        }
        if let Some(balances) = self.balances_by_owner {
            record.balances_by_owner = balances;
        }
        if let Some(pool) = self.pool {
            record.pool = pool;
        }
        if let Some(initialized) = self.initialized {
            record.initialized = initialized;
        }
        if let Some(dirty) = self.dirty {
            record.dirty = dirty;
        }
        if let Some(loading) = self.loading {
            record.loading = loading;
        }
    }
}
