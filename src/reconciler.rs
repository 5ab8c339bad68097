use alloy_primitives::{Address, U256};
use anyhow::bail;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connector::{BalanceTable, ChainConnector};
use crate::contract_params::{ContractParams, parse_decimal};
use crate::error::{ButlerError, ButlerResult};
use crate::token::TokenRecord;

const PARAM_NAME: &str = "name";
const PARAM_SYMBOL: &str = "symbol";
const PARAM_DECIMALS: &str = "decimals";
const PARAM_TOTAL_SUPPLY: &str = "total_supply";
const PARAM_INIT_SUPPLY: &str = "init_supply";

/// Rebuilds a contract-backed token record from chain reads.
pub struct BalanceReconciler<C> {
    connector: Arc<C>,
}

impl<C> Clone for BalanceReconciler<C> {
    fn clone(&self) -> Self {
        BalanceReconciler {
            connector: Arc::clone(&self.connector),
        }
    }
}

impl<C: ChainConnector> BalanceReconciler<C> {
    pub fn new(connector: Arc<C>) -> Self {
        BalanceReconciler { connector }
    }

    /// Fetch init params, the balance table and the pool reference of
    /// `current.address` and return the refreshed record.
    ///
    /// `wallet` selects the holder whose entry becomes `own_balance`.
    pub async fn reconcile(
        &self,
        current: &TokenRecord,
        wallet: Option<Address>,
    ) -> ButlerResult<TokenRecord> {
        let address = current.address;

        let entries = self
            .connector
            .get_init_params(address)
            .await
            .map_err(|e| ButlerError::fetch(format!("init params of {address}"), e))?;
        let params = ContractParams::decode(&entries);

        let table = self
            .connector
            .get_balance_table(address)
            .await
            .map_err(|e| ButlerError::fetch(format!("balance table of {address}"), e))?;
        let balances = convert_balance_table(&table)
            .map_err(|e| ButlerError::fetch(format!("balance table of {address}"), e))?;

        let pool = self
            .connector
            .get_pool_for(address)
            .await
            .map_err(|e| ButlerError::fetch(format!("pool of {address}"), e))?;

        let own_balance = wallet
            .and_then(|owner| balances.get(&owner).copied())
            .unwrap_or(U256::ZERO);

        let decode = |e| ButlerError::fetch(format!("init params of {address}"), e);
        let decimals = params.u8(PARAM_DECIMALS).map_err(decode)?;
        let total_supply = match params.u256(PARAM_TOTAL_SUPPLY).map_err(decode)? {
            Some(supply) => Some(supply),
            None => params.u256(PARAM_INIT_SUPPLY).map_err(decode)?,
        };

        debug!(
            token = %address,
            holders = balances.len(),
            own_balance = %own_balance,
            "reconciled token"
        );

        Ok(TokenRecord {
            address,
            symbol: params
                .text(PARAM_SYMBOL)
                .unwrap_or_else(|| current.symbol.clone()),
            name: params.text(PARAM_NAME).unwrap_or_else(|| current.name.clone()),
            decimals: decimals.unwrap_or(current.decimals),
            total_supply: total_supply.unwrap_or(current.total_supply),
            own_balance,
            balances_by_owner: balances,
            is_native_currency: false,
            initialized: true,
            dirty: false,
            loading: false,
            list_priority: current.list_priority,
            pool,
        })
    }
}

/// Parse holder keys into addresses and decimal amounts into `U256`.
///
/// Address parsing is case-insensitive, so `0xABC..` and `0xabc..` land on the
/// same key; such duplicates must agree on the amount. Keys that are not
/// addresses are skipped.
pub fn convert_balance_table(table: &BalanceTable) -> anyhow::Result<BTreeMap<Address, U256>> {
    let mut balances: BTreeMap<Address, U256> = BTreeMap::new();
    for (holder, amount) in table {
        let Ok(owner) = Address::from_str(holder.trim()) else {
            warn!(holder = %holder, "skipping non-address key in balance table");
            continue;
        };
        let amount = parse_decimal(amount)?;
        match balances.insert(owner, amount) {
            Some(previous) if previous != amount => {
                bail!("conflicting balances for holder {owner:#x}: {previous} and {amount}");
            }
            _ => {}
        }
    }
    Ok(balances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::InMemoryConnector;
    use crate::contract_params::ParamEntry;
    use crate::token::{PoolRef, TokenDescriptor};
    use alloy_primitives::address;

    const TOKEN: Address = address!("1111111111111111111111111111111111111111");
    const WALLET: Address = address!("abcdefabcdefabcdefabcdefabcdefabcdefabcd");

    fn setup() -> (Arc<InMemoryConnector>, TokenRecord) {
        let connector = Arc::new(InMemoryConnector::new());
        let descriptor = TokenDescriptor {
            address: TOKEN,
            decimals: 12,
            symbol: "GOV".to_string(),
        };
        connector.add_token(
            descriptor.clone(),
            vec![
                ParamEntry::new("name", "String", "Governance"),
                ParamEntry::new("symbol", "String", "GOV"),
                ParamEntry::new("decimals", "Uint32", "12"),
                ParamEntry::new("init_supply", "Uint128", "1000000"),
            ],
        );
        (connector, TokenRecord::from_descriptor(&descriptor))
    }

    #[tokio::test]
    async fn own_balance_matches_mixed_case_holder() {
        let (connector, record) = setup();
        connector.set_balance(TOKEN, "0xABCDEFABCDEFABCDEFABCDEFABCDEFABCDEFABCD", "250");
        connector.set_balance(TOKEN, "0x2222222222222222222222222222222222222222", "750");

        let refreshed = BalanceReconciler::new(connector)
            .reconcile(&record, Some(WALLET))
            .await
            .unwrap();

        assert_eq!(refreshed.own_balance, U256::from(250u64));
        assert_eq!(refreshed.balance_of(&WALLET), U256::from(250u64));
        assert_eq!(refreshed.balances_by_owner.len(), 2);
        assert_eq!(refreshed.name, "Governance");
        assert_eq!(refreshed.total_supply, U256::from(1_000_000u64));
        assert!(refreshed.initialized && !refreshed.dirty && !refreshed.loading);
        assert!(refreshed.pool.is_none());
    }

    #[tokio::test]
    async fn absent_holder_has_zero_balance() {
        let (connector, record) = setup();
        connector.set_balance(TOKEN, "0x2222222222222222222222222222222222222222", "750");

        let refreshed = BalanceReconciler::new(connector)
            .reconcile(&record, Some(WALLET))
            .await
            .unwrap();

        assert_eq!(refreshed.own_balance, U256::ZERO);
    }

    #[tokio::test]
    async fn balances_wider_than_u128_survive() {
        let (connector, record) = setup();
        let huge = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        connector.set_balance(TOKEN, format!("{WALLET:#x}"), huge);

        let refreshed = BalanceReconciler::new(connector)
            .reconcile(&record, Some(WALLET))
            .await
            .unwrap();

        assert_eq!(refreshed.own_balance, U256::MAX);
    }

    #[tokio::test]
    async fn pool_reference_is_attached_when_present() {
        let (connector, record) = setup();
        let pool = PoolRef {
            address: Address::repeat_byte(0x33),
            quote_token: Address::repeat_byte(0x44),
        };
        connector.set_pool(TOKEN, pool.clone());

        let refreshed = BalanceReconciler::new(connector)
            .reconcile(&record, None)
            .await
            .unwrap();

        assert_eq!(refreshed.pool, Some(pool));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (connector, record) = setup();
        connector.set_balance(TOKEN, format!("{WALLET:#x}"), "5");
        connector.set_balance(TOKEN, "0x2222222222222222222222222222222222222222", "6");
        let reconciler = BalanceReconciler::new(connector);

        let first = reconciler.reconcile(&record, Some(WALLET)).await.unwrap();
        let second = reconciler.reconcile(&record, Some(WALLET)).await.unwrap();

        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn fetch_failure_propagates() {
        let (connector, record) = setup();
        connector.set_failing(TOKEN, true);

        let err = BalanceReconciler::new(connector)
            .reconcile(&record, Some(WALLET))
            .await
            .unwrap_err();

        assert!(matches!(err, ButlerError::FetchFailure { .. }));
    }

    #[test]
    fn undecodable_amount_is_an_error() {
        let mut table = BalanceTable::new();
        table.insert(format!("{WALLET:#x}"), "12abc".to_string());
        assert!(convert_balance_table(&table).is_err());
    }

    #[test]
    fn non_address_keys_are_skipped() {
        let mut table = BalanceTable::new();
        table.insert("_balance".to_string(), "1".to_string());
        table.insert(format!("{WALLET:#x}"), "2".to_string());

        let balances = convert_balance_table(&table).unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances.get(&WALLET), Some(&U256::from(2u64)));
    }

    #[test]
    fn case_variant_keys_must_agree() {
        let upper = format!("0x{}", "ABCDEF".repeat(6) + "ABCD");
        let lower = format!("{WALLET:#x}");

        let mut table = BalanceTable::new();
        table.insert(upper.clone(), U256::MAX.to_string());
        table.insert(lower.clone(), "2".to_string());
        assert!(convert_balance_table(&table).is_err());

        let mut table = BalanceTable::new();
        table.insert(upper, "7".to_string());
        table.insert(lower, "7".to_string());
        let balances = convert_balance_table(&table).unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances.get(&WALLET), Some(&U256::from(7u64)));
    }

    #[tokio::test]
    async fn conflicting_case_variants_fail_the_refresh() {
        let (connector, record) = setup();
        connector.set_balance(TOKEN, format!("0x{}", "ABCDEF".repeat(6) + "ABCD"), "5");
        connector.set_balance(TOKEN, format!("{WALLET:#x}"), "6");

        let reconciler = BalanceReconciler::new(connector);
        let result = reconciler.reconcile(&record, Some(WALLET)).await;
        assert!(matches!(result, Err(ButlerError::FetchFailure { .. })));
    }
}
