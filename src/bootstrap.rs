use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::connector::ChainConnector;
use crate::error::{ButlerError, ButlerResult};
use crate::store::{Action, StateStore};
use crate::token::{NATIVE_CURRENCY_ADDRESS, NativeCurrency, TokenDescriptor, TokenRecord};
use crate::wallet::WalletSnapshot;

/// Seeds the token collection once a wallet is connected.
pub struct BootstrapInitializer<C> {
    connector: Arc<C>,
    native: NativeCurrency,
}

impl<C: ChainConnector> BootstrapInitializer<C> {
    pub fn new(connector: Arc<C>, native: NativeCurrency) -> Self {
        BootstrapInitializer { connector, native }
    }

    /// Records for every known token plus the native-currency pseudo-token.
    pub fn seed_records(
        &self,
        descriptors: &[TokenDescriptor],
        wallet: &WalletSnapshot,
    ) -> Vec<TokenRecord> {
        let mut records: BTreeMap<_, _> = BTreeMap::new();
        for descriptor in descriptors {
            if descriptor.address == NATIVE_CURRENCY_ADDRESS {
                warn!(
                    symbol = %descriptor.symbol,
                    "known token uses the native currency address, skipping"
                );
                continue;
            }
            records.insert(descriptor.address, TokenRecord::from_descriptor(descriptor));
        }
        records.insert(
            NATIVE_CURRENCY_ADDRESS,
            TokenRecord::native(&self.native, wallet),
        );
        records.into_values().collect()
    }

    /// Seed the store if a wallet is present and the collection is not
    /// initialized yet. Returns whether a seed was dispatched.
    pub async fn run(&self, store: &StateStore) -> ButlerResult<bool> {
        let Some(wallet) = store.read(|state| {
            (!state.tokens_initialized)
                .then(|| state.wallet.clone())
                .flatten()
        }) else {
            return Ok(false);
        };

        let descriptors = self
            .connector
            .list_known_tokens()
            .await
            .map_err(|e| ButlerError::fetch("known token list", e))?;

        // The wallet may have changed while the list was loading.
        let still_wanted = store.read(|state| {
            !state.tokens_initialized
                && state
                    .wallet
                    .as_ref()
                    .is_some_and(|current| current.address == wallet.address)
        });
        if !still_wanted {
            return Ok(false);
        }

        let records = self.seed_records(&descriptors, &wallet);
        info!(
            wallet = %wallet.address,
            tokens = records.len(),
            "seeding token collection"
        );
        store.dispatch(Action::TokenInit(records));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::InMemoryConnector;
    use alloy_primitives::{Address, U256};
    use std::str::FromStr;

    fn wallet() -> WalletSnapshot {
        let address = Address::from_str("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        WalletSnapshot::watch_only(address, U256::from(500u64), "mainnet")
    }

    fn connector_with_tokens() -> Arc<InMemoryConnector> {
        let connector = Arc::new(InMemoryConnector::new());
        for (byte, symbol) in [(1u8, "AAA"), (2, "BBB")] {
            connector.add_token(
                TokenDescriptor {
                    address: Address::repeat_byte(byte),
                    decimals: 6,
                    symbol: symbol.to_string(),
                },
                Vec::new(),
            );
        }
        connector
    }

    #[tokio::test]
    async fn seeds_known_tokens_and_native_entry() {
        let store = StateStore::new();
        store.dispatch(Action::WalletUpdate(Some(wallet())));
        let bootstrap =
            BootstrapInitializer::new(connector_with_tokens(), NativeCurrency::default());

        assert!(bootstrap.run(&store).await.unwrap());

        let state = store.state();
        assert!(state.tokens_initialized);
        assert_eq!(state.tokens.len(), 3);

        let native = state.token(&NATIVE_CURRENCY_ADDRESS).unwrap();
        assert!(native.is_native_currency);
        assert!(native.initialized);
        assert_eq!(native.own_balance, U256::from(500u64));
        let lowercase = Address::from_str("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(native.balance_of(&lowercase), U256::from(500u64));

        let token = state.token(&Address::repeat_byte(1)).unwrap();
        assert!(!token.initialized);
        assert_eq!(token.symbol, "AAA");
    }

    #[tokio::test]
    async fn runs_once_per_wallet() {
        let store = StateStore::new();
        store.dispatch(Action::WalletUpdate(Some(wallet())));
        let bootstrap =
            BootstrapInitializer::new(connector_with_tokens(), NativeCurrency::default());

        assert!(bootstrap.run(&store).await.unwrap());
        assert!(!bootstrap.run(&store).await.unwrap());
        assert_eq!(store.read(|s| s.session), 1);
    }

    #[tokio::test]
    async fn waits_for_a_wallet() {
        let store = StateStore::new();
        let bootstrap =
            BootstrapInitializer::new(connector_with_tokens(), NativeCurrency::default());

        assert!(!bootstrap.run(&store).await.unwrap());
        assert!(!store.read(|s| s.tokens_initialized));
    }

    #[test]
    fn duplicate_and_sentinel_descriptors_collapse() {
        let bootstrap = BootstrapInitializer::new(
            Arc::new(InMemoryConnector::new()),
            NativeCurrency::default(),
        );
        let descriptors = vec![
            TokenDescriptor {
                address: Address::repeat_byte(1),
                decimals: 6,
                symbol: "OLD".to_string(),
            },
            TokenDescriptor {
                address: Address::repeat_byte(1),
                decimals: 6,
                symbol: "NEW".to_string(),
            },
            TokenDescriptor {
                address: NATIVE_CURRENCY_ADDRESS,
                decimals: 18,
                symbol: "FAKE".to_string(),
            },
        ];

        let records = bootstrap.seed_records(&descriptors, &wallet());
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.symbol == "NEW"));
        assert!(records.iter().any(|r| r.is_native_currency && r.symbol == "ETH"));
    }
}
