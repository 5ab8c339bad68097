use alloy_primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

/// Opaque handle to the wallet's signing key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKeyHandle(String);

impl PrivateKeyHandle {
    pub fn new(key: impl Into<String>) -> Self {
        PrivateKeyHandle(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyHandle(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub address: Address,
    pub balance: U256,
    pub network: String,
    pub private_key: Option<PrivateKeyHandle>,
}

impl WalletSnapshot {
    pub fn watch_only(address: Address, balance: U256, network: impl Into<String>) -> Self {
        WalletSnapshot {
            address,
            balance,
            network: network.into(),
            private_key: None,
        }
    }
}

/// Wallet subsystem as seen by the butler.
#[async_trait]
pub trait WalletProvider: Send + Sync + 'static {
    /// Re-open the wallet behind `private_key` and read its current balance.
    async fn reconnect(
        &self,
        private_key: &PrivateKeyHandle,
        network: &str,
    ) -> Result<WalletSnapshot>;
}
