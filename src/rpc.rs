use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, TransactionRequest};
use alloy::sol_types::SolCall;
use alloy_primitives::{Address, B256, Bytes, U256};
use anyhow::{Result, anyhow};
use regex::Regex;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

use crate::transaction::ReceiptSummary;

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESULTS_ERROR: &str = "exceeds max results";

/// JSON-RPC access over one or more endpoints, rotating to the next endpoint
/// whenever a request fails or times out.
#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
    max_retries: usize,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String]) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow!("At least one RPC URL must be provided"));
        }

        let providers = rpc_urls
            .iter()
            .map(|url| {
                let parsed_url = url
                    .parse()
                    .map_err(|_| anyhow!("Invalid RPC URL: {}", url))?;
                Ok(ProviderBuilder::new().connect_http(parsed_url))
            })
            .collect::<Result<Vec<AlloyFullProvider>>>()?;

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
            max_retries: 5,
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let next = (self.current_provider.load(Ordering::Relaxed) + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!(endpoint = next, "rotating RPC provider");
        }
    }

    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries)
    }

    fn handle_error(&self, method: &str, error: &str) {
        warn!(
            method,
            endpoint = %self.get_current_url(),
            error,
            "RPC error, rotating provider"
        );
        self.rotate_provider();
    }

    fn handle_timeout(&self, method: &str) -> anyhow::Error {
        warn!(
            method,
            endpoint = %self.get_current_url(),
            timeout_secs = REQUEST_TIMEOUT.as_secs(),
            "RPC request timed out, rotating provider"
        );
        self.rotate_provider();
        anyhow!(
            "{} timed out after {} seconds",
            method,
            REQUEST_TIMEOUT.as_secs()
        )
    }

    /// Run `op` against the current provider with timeout, rotation and retries.
    async fn request<T, E, F, Fut>(&self, method: &'static str, op: F) -> Result<T>
    where
        F: Fn(AlloyFullProvider) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        T: Send,
        E: Display + Send,
    {
        self.request_until(method, op, |_| false).await
    }

    /// Like [`request`](Self::request), but errors matching `give_up` are
    /// returned at once instead of being retried.
    async fn request_until<T, E, F, Fut>(
        &self,
        method: &'static str,
        op: F,
        give_up: fn(&str) -> bool,
    ) -> Result<T>
    where
        F: Fn(AlloyFullProvider) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        T: Send,
        E: Display + Send,
    {
        Retry::spawn(self.get_retry_strategy(), || {
            let client = self.clone();
            let call = op(client.get_provider().clone());
            async move {
                match timeout(REQUEST_TIMEOUT, call).await {
                    Ok(Ok(value)) => Ok(Ok(value)),
                    Ok(Err(e)) => {
                        let error = e.to_string();
                        if give_up(&error) {
                            return Ok(Err(anyhow!(error)));
                        }
                        client.handle_error(method, &error);
                        Err(anyhow!(error))
                    }
                    Err(_) => Err(client.handle_timeout(method)),
                }
            }
        })
        .await
        .and_then(|r| r)
    }

    pub async fn get_latest_block(&self) -> Result<u64> {
        self.request("eth_blockNumber", |provider| async move {
            provider.get_block_number().await
        })
        .await
    }

    pub async fn get_code_at_block(&self, address: Address, block_number: u64) -> Result<Bytes> {
        self.request("eth_getCode", move |provider| async move {
            provider
                .get_code_at(address)
                .block_id(BlockNumberOrTag::Number(block_number).into())
                .await
        })
        .await
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256> {
        self.request("eth_getBalance", move |provider| async move {
            provider.get_balance(address).await
        })
        .await
    }

    pub async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptSummary>> {
        let receipt = self
            .request("eth_getTransactionReceipt", move |provider| async move {
                provider.get_transaction_receipt(hash).await
            })
            .await?;

        Ok(receipt.map(|receipt| ReceiptSummary {
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            success: receipt.status(),
        }))
    }

    /// `eth_call` of a typed contract function.
    pub async fn call_contract<C>(&self, to: Address, call: C) -> Result<C::Return>
    where
        C: SolCall + Send,
        C::Return: Send,
    {
        let input = Bytes::from(call.abi_encode());
        let raw = self
            .request("eth_call", move |provider| {
                let tx = TransactionRequest::default().to(to).input(input.clone().into());
                async move { provider.call(tx).await }
            })
            .await?;

        C::abi_decode_returns(&raw)
            .map_err(|e| anyhow!("failed to decode {} result from {}: {}", C::SIGNATURE, to, e))
    }

    async fn get_logs_window(
        &self,
        from_block: u64,
        to_block: u64,
        contract_address: Address,
        topic0: B256,
    ) -> Result<Vec<Log>> {
        self.request_until(
            "eth_getLogs",
            move |provider| {
                let filter = Filter::new()
                    .address(contract_address)
                    .event_signature(topic0)
                    .from_block(from_block)
                    .to_block(to_block);
                async move { provider.get_logs(&filter).await }
            },
            |error| error.contains(MAX_RESULTS_ERROR),
        )
        .await
    }

    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    /// A suggested window is only usable when it starts where the scan stands
    /// and strictly shrinks the remaining range.
    fn accept_range_hint(
        (from, to): (u64, u64),
        current_from: u64,
        to_block: u64,
    ) -> Option<(u64, u64)> {
        (from == current_from && from <= to && to < to_block).then_some((from, to))
    }

    /// Logs of `contract_address` with `topic0` in `[from_block, to_block]`,
    /// splitting the range when the endpoint caps the result size.
    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        contract_address: Address,
        topic0: B256,
    ) -> Result<Vec<Log>> {
        let mut all_logs = Vec::new();
        let mut current_from = from_block;

        while current_from <= to_block {
            let error = match self
                .get_logs_window(current_from, to_block, contract_address, topic0)
                .await
            {
                Ok(logs) => {
                    all_logs.extend(logs);
                    break;
                }
                Err(e) => e,
            };

            let message = error.to_string();
            let Some((suggested_from, suggested_to)) = message
                .contains(MAX_RESULTS_ERROR)
                .then(|| Self::parse_max_results_error(&message))
                .flatten()
                .and_then(|hint| Self::accept_range_hint(hint, current_from, to_block))
            else {
                return Err(error);
            };

            info!(
                from = current_from,
                to = to_block,
                split_at = suggested_to,
                "log range too large, splitting"
            );
            let logs = self
                .get_logs_window(suggested_from, suggested_to, contract_address, topic0)
                .await?;
            all_logs.extend(logs);
            current_from = suggested_to + 1;
        }

        Ok(all_logs)
    }
}
