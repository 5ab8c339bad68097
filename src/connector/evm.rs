//! `ChainConnector` over an Ethereum JSON-RPC endpoint.
//!
//! Token balance tables are rebuilt from `Transfer` logs, scanned from the
//! contract's deployment block and then advanced incrementally on later reads.

use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{BalanceTable, ChainConnector, ObserverSender, ObserverSlot};
use crate::contract_params::ParamEntry;
use crate::events::{IERC20Metadata, IUniswapV2Factory, Transfer, decode_transfer_event};
use crate::rpc::RpcClient;
use crate::token::{PoolRef, TokenDescriptor};
use crate::transaction::{TransactionEvent, TransactionStatus};
use crate::wallet::{PrivateKeyHandle, WalletProvider, WalletSnapshot};

const BATCH_SIZE: u64 = 1000; // Most public RPCs allow up to 1k logs per request
const RATE_LIMIT_DELAY_MS: u64 = 200;
const DEFAULT_DECIMALS: u8 = 18;
const MAX_RECEIPT_POLLS: u32 = 900;

#[derive(Debug, Clone)]
pub struct EvmConnectorConfig {
    pub tokens: Vec<Address>,
    pub pool_factory: Option<Address>,
    pub wrapped_native: Option<Address>,
    pub receipt_poll_interval: Duration,
}

/// Balances accumulated from Transfer logs up to `next_block - 1`.
#[derive(Debug, Clone, Default)]
struct TransferScan {
    next_block: u64,
    balances: HashMap<Address, U256>,
}

impl TransferScan {
    fn apply(&mut self, from: Address, to: Address, value: U256) {
        if from != Address::ZERO {
            let balance = self.balances.entry(from).or_insert(U256::ZERO);
            *balance = balance.saturating_sub(value);
        }
        if to != Address::ZERO {
            let balance = self.balances.entry(to).or_insert(U256::ZERO);
            *balance = balance.saturating_add(value);
        }
    }

    fn table(&self) -> BalanceTable {
        self.balances
            .iter()
            .filter(|(_, balance)| !balance.is_zero())
            .map(|(holder, balance)| (format!("{holder:#x}"), balance.to_string()))
            .collect()
    }
}

pub struct EvmConnector {
    client: RpcClient,
    config: EvmConnectorConfig,
    scans: Mutex<HashMap<Address, TransferScan>>,
    observer: Arc<ObserverSlot>,
}

impl EvmConnector {
    pub fn new(client: RpcClient, config: EvmConnectorConfig) -> Self {
        EvmConnector {
            client,
            config,
            scans: Mutex::new(HashMap::new()),
            observer: Arc::new(ObserverSlot::new()),
        }
    }

    fn scans(&self) -> MutexGuard<'_, HashMap<Address, TransferScan>> {
        self.scans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_descriptor(&self, address: Address) -> TokenDescriptor {
        let symbol = match self
            .client
            .call_contract(address, IERC20Metadata::symbolCall {})
            .await
        {
            Ok(symbol) => symbol,
            Err(e) => {
                warn!(token = %address, error = %e, "failed to fetch token symbol");
                "?".to_string()
            }
        };

        let decimals = match self
            .client
            .call_contract(address, IERC20Metadata::decimalsCall {})
            .await
        {
            Ok(decimals) => decimals,
            Err(e) => {
                warn!(token = %address, error = %e, "failed to fetch token decimals");
                DEFAULT_DECIMALS
            }
        };

        TokenDescriptor {
            address,
            decimals,
            symbol,
        }
    }

    /// First block at which `address` has code, found by binary search.
    async fn find_deployment_block(&self, address: Address, latest_block: u64) -> Result<u64> {
        let code = self.client.get_code_at_block(address, latest_block).await?;
        if code.is_empty() {
            bail!("Address {} is not a deployed contract", address);
        }

        let (mut low, mut high) = (0u64, latest_block);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.client.get_code_at_block(address, mid).await?.is_empty() {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        info!(token = %address, block = low, "found deployment block");
        Ok(low)
    }

    async fn advance_scan(
        &self,
        token: Address,
        scan: &mut TransferScan,
        latest: u64,
    ) -> Result<()> {
        while scan.next_block <= latest {
            let to_block = (scan.next_block + BATCH_SIZE - 1).min(latest);
            let logs = self
                .client
                .get_logs(scan.next_block, to_block, token, Transfer::SIGNATURE_HASH)
                .await
                .with_context(|| {
                    format!("transfer logs {}..={} of {}", scan.next_block, to_block, token)
                })?;

            for log in &logs {
                match decode_transfer_event(log) {
                    Ok(transfer) => scan.apply(transfer.from, transfer.to, transfer.value),
                    Err(e) => warn!(token = %token, error = %e, "failed to decode transfer event"),
                }
            }

            debug!(
                token = %token,
                from = scan.next_block,
                to = to_block,
                logs = logs.len(),
                "scanned transfer logs"
            );
            scan.next_block = to_block + 1;

            if scan.next_block <= latest {
                sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
            }
        }
        Ok(())
    }

    /// Publish `Pending` for `hash`, then poll its receipt in the background and
    /// publish the final status once mined.
    pub fn watch_transaction(&self, hash: B256) {
        self.observer.publish(TransactionEvent::pending(hash));

        let client = self.client.clone();
        let observer = Arc::clone(&self.observer);
        let poll_interval = self.config.receipt_poll_interval;

        tokio::spawn(async move {
            for _ in 0..MAX_RECEIPT_POLLS {
                sleep(poll_interval).await;
                match client.get_transaction_receipt(hash).await {
                    Ok(Some(receipt)) => {
                        let status = if receipt.success {
                            TransactionStatus::Confirmed
                        } else {
                            TransactionStatus::Rejected
                        };
                        info!(tx = %hash, ?status, "transaction mined");
                        observer.publish(TransactionEvent {
                            hash,
                            status,
                            receipt: Some(receipt),
                        });
                        return;
                    }
                    Ok(None) => continue,
                    Err(e) => warn!(tx = %hash, error = %e, "receipt lookup failed"),
                }
            }
            warn!(tx = %hash, "gave up waiting for transaction receipt");
        });
    }
}

#[async_trait]
impl ChainConnector for EvmConnector {
    async fn list_known_tokens(&self) -> Result<Vec<TokenDescriptor>> {
        let descriptors = join_all(
            self.config
                .tokens
                .iter()
                .map(|address| self.fetch_descriptor(*address)),
        )
        .await;
        Ok(descriptors)
    }

    async fn get_pool_for(&self, token: Address) -> Result<Option<PoolRef>> {
        let (Some(factory), Some(wrapped)) = (self.config.pool_factory, self.config.wrapped_native)
        else {
            return Ok(None);
        };
        if token == wrapped {
            return Ok(None);
        }

        let pair = self
            .client
            .call_contract(
                factory,
                IUniswapV2Factory::getPairCall {
                    tokenA: token,
                    tokenB: wrapped,
                },
            )
            .await?;

        Ok((pair != Address::ZERO).then_some(PoolRef {
            address: pair,
            quote_token: wrapped,
        }))
    }

    async fn get_init_params(&self, token: Address) -> Result<Vec<ParamEntry>> {
        let mut params = Vec::with_capacity(4);

        match self
            .client
            .call_contract(token, IERC20Metadata::nameCall {})
            .await
        {
            Ok(name) => params.push(ParamEntry::new("name", "string", name)),
            Err(e) => debug!(token = %token, error = %e, "token has no name()"),
        }
        match self
            .client
            .call_contract(token, IERC20Metadata::symbolCall {})
            .await
        {
            Ok(symbol) => params.push(ParamEntry::new("symbol", "string", symbol)),
            Err(e) => debug!(token = %token, error = %e, "token has no symbol()"),
        }

        let decimals = self
            .client
            .call_contract(token, IERC20Metadata::decimalsCall {})
            .await
            .with_context(|| format!("decimals() of {token}"))?;
        params.push(ParamEntry::new("decimals", "uint8", decimals.to_string()));

        let total_supply = self
            .client
            .call_contract(token, IERC20Metadata::totalSupplyCall {})
            .await
            .with_context(|| format!("totalSupply() of {token}"))?;
        params.push(ParamEntry::new(
            "total_supply",
            "uint256",
            total_supply.to_string(),
        ));

        Ok(params)
    }

    async fn get_balance_table(&self, token: Address) -> Result<BalanceTable> {
        let latest = self.client.get_latest_block().await?;

        let cached = self.scans().remove(&token);
        let mut scan = match cached {
            Some(scan) => scan,
            None => TransferScan {
                next_block: self.find_deployment_block(token, latest).await?,
                balances: HashMap::new(),
            },
        };

        // Progress made before a failure is kept for the next read.
        let result = self.advance_scan(token, &mut scan, latest).await;
        let table = scan.table();
        self.scans().insert(token, scan);
        result?;

        Ok(table)
    }

    fn register_transaction_observer(&self, observer: Option<ObserverSender>) {
        self.observer.replace(observer);
    }
}

/// Wallet backed by a local private key, with balances read over RPC.
pub struct EvmWallet {
    client: RpcClient,
}

impl EvmWallet {
    pub fn new(client: RpcClient) -> Self {
        EvmWallet { client }
    }

    /// Snapshot for a watch-only address.
    pub async fn watch(&self, address: Address, network: &str) -> Result<WalletSnapshot> {
        let balance = self.client.get_balance(address).await?;
        Ok(WalletSnapshot::watch_only(address, balance, network))
    }
}

#[async_trait]
impl WalletProvider for EvmWallet {
    async fn reconnect(
        &self,
        private_key: &PrivateKeyHandle,
        network: &str,
    ) -> Result<WalletSnapshot> {
        let signer: PrivateKeySigner = private_key
            .expose()
            .parse()
            .context("Invalid wallet private key")?;
        let address = signer.address();
        let balance = self.client.get_balance(address).await?;

        Ok(WalletSnapshot {
            address,
            balance,
            network: network.to_string(),
            private_key: Some(private_key.clone()),
        })
    }
}
