use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::connector::evm::EvmConnectorConfig;
use crate::observer::DEFAULT_EVENT_QUEUE_CAPACITY;
use crate::token::NativeCurrency;
use crate::wallet::PrivateKeyHandle;

#[derive(Debug, Clone)]
pub struct Config {
    pub json_rpc_urls: Vec<String>,
    pub token_addresses: Vec<Address>,
    pub wallet_private_key: Option<PrivateKeyHandle>,
    pub wallet_address: Option<Address>,
    pub network: String,
    pub pool_factory: Option<Address>,
    pub wrapped_native: Option<Address>,
    pub native: NativeCurrency,
    pub tx_event_queue_capacity: usize,
    pub receipt_poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let json_rpc_urls = std::env::var("JSON_RPC_URLS")
            .or_else(|_| std::env::var("JSON_RPC_URL"))
            .context("JSON_RPC_URLS must be set in .env")?;
        let json_rpc_urls = split_list(&json_rpc_urls)
            .map(str::to_string)
            .collect::<Vec<_>>();

        let token_addresses = split_list(&env_or_default("TOKEN_ADDRESSES", ""))
            .map(|raw| {
                Address::from_str(raw)
                    .with_context(|| format!("Invalid address in TOKEN_ADDRESSES: {raw}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let wallet_private_key = optional_env("WALLET_PRIVATE_KEY").map(PrivateKeyHandle::new);
        let wallet_address = parse_optional_address("WALLET_ADDRESS")?;

        let native = NativeCurrency {
            symbol: env_or_default("NATIVE_SYMBOL", "ETH"),
            name: env_or_default("NATIVE_NAME", "Ether"),
            decimals: env_or_default("NATIVE_DECIMALS", "18")
                .parse()
                .context("Invalid NATIVE_DECIMALS")?,
        };

        let tx_event_queue_capacity = env_or_default(
            "TX_EVENT_QUEUE_CAPACITY",
            &DEFAULT_EVENT_QUEUE_CAPACITY.to_string(),
        )
        .parse()
        .context("Invalid TX_EVENT_QUEUE_CAPACITY")?;

        let receipt_poll_secs: u64 = env_or_default("RECEIPT_POLL_INTERVAL_SECS", "4")
            .parse()
            .context("Invalid RECEIPT_POLL_INTERVAL_SECS")?;

        Ok(Config {
            json_rpc_urls,
            token_addresses,
            wallet_private_key,
            wallet_address,
            network: env_or_default("NETWORK", "mainnet"),
            pool_factory: parse_optional_address("POOL_FACTORY")?,
            wrapped_native: parse_optional_address("WRAPPED_NATIVE")?,
            native,
            tx_event_queue_capacity,
            receipt_poll_interval: Duration::from_secs(receipt_poll_secs.max(1)),
        })
    }

    pub fn connector_config(&self) -> EvmConnectorConfig {
        EvmConnectorConfig {
            tokens: self.token_addresses.clone(),
            pool_factory: self.pool_factory,
            wrapped_native: self.wrapped_native,
            receipt_poll_interval: self.receipt_poll_interval,
        }
    }
}

pub fn parse_tx_hash(raw: &str) -> Result<B256> {
    B256::from_str(raw.trim()).with_context(|| format!("Invalid transaction hash: {raw}"))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or_default(key: &str, default: &str) -> String {
    optional_env(key).unwrap_or_else(|| default.to_string())
}

fn parse_optional_address(key: &str) -> Result<Option<Address>> {
    optional_env(key)
        .map(|raw| Address::from_str(&raw).with_context(|| format!("Invalid {key} format")))
        .transpose()
}
