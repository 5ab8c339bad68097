use crate::store::ButlerState;
use crate::token::TokenRecord;
use crate::transaction::TransactionRecord;
use alloy_primitives::U256;
use alloy_primitives::utils::format_units;
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

fn amount(value: U256, decimals: u8) -> String {
    format_units(value, decimals).unwrap_or_else(|_| value.to_string())
}

fn status(token: &TokenRecord) -> &'static str {
    if token.loading {
        "loading"
    } else if !token.initialized {
        "uninitialized"
    } else if token.dirty {
        "dirty"
    } else {
        "ready"
    }
}

/// Tokens ordered by list priority, then symbol.
fn sorted_tokens(state: &ButlerState) -> Vec<&TokenRecord> {
    let mut tokens: Vec<&TokenRecord> = state.tokens.values().collect();
    tokens.sort_by(|a, b| {
        a.list_priority
            .unwrap_or(u32::MAX)
            .cmp(&b.list_priority.unwrap_or(u32::MAX))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    tokens
}

pub fn format_tokens(state: &ButlerState, format: &OutputFormat) -> String {
    let tokens = sorted_tokens(state);
    match format {
        OutputFormat::Table => format_tokens_table(&tokens),
        OutputFormat::Json => format_tokens_json(&tokens),
        OutputFormat::Csv => format_tokens_csv(&tokens),
    }
}

fn format_tokens_table(tokens: &[&TokenRecord]) -> String {
    if tokens.is_empty() {
        return "No tokens loaded.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            "Symbol",
            "Name",
            "Address",
            "Balance",
            "Total Supply",
            "Holders",
            "Pool",
            "Status",
        ]);

    for token in tokens {
        let address = if token.is_native_currency {
            "native".to_string()
        } else {
            format!("{:#}", token.address)
        };
        table.add_row(vec![
            Cell::new(&token.symbol),
            Cell::new(&token.name),
            Cell::new(address),
            Cell::new(amount(token.own_balance, token.decimals)),
            Cell::new(amount(token.total_supply, token.decimals)),
            Cell::new(token.balances_by_owner.len()),
            Cell::new(
                token
                    .pool
                    .as_ref()
                    .map_or("-".to_string(), |pool| format!("{:#}", pool.address)),
            ),
            Cell::new(status(token)),
        ]);
    }

    table.to_string()
}

fn format_tokens_json(tokens: &[&TokenRecord]) -> String {
    let json_tokens: Vec<_> = tokens
        .iter()
        .map(|token| {
            json!({
                "address": token.address,
                "symbol": token.symbol,
                "name": token.name,
                "decimals": token.decimals,
                "balance": amount(token.own_balance, token.decimals),
                "balance_raw": token.own_balance.to_string(),
                "total_supply": token.total_supply.to_string(),
                "holders": token.balances_by_owner.len(),
                "native": token.is_native_currency,
                "pool": token.pool.as_ref().map(|pool| pool.address),
                "status": status(token),
            })
        })
        .collect();

    serde_json::to_string_pretty(&json_tokens).unwrap_or_else(|_| "[]".to_string())
}

fn format_tokens_csv(tokens: &[&TokenRecord]) -> String {
    let mut wtr = Writer::from_writer(vec![]);

    let _ = wtr.write_record([
        "symbol",
        "name",
        "address",
        "decimals",
        "balance",
        "balance_raw",
        "total_supply",
        "status",
    ]);

    for token in tokens {
        let _ = wtr.write_record([
            token.symbol.as_str(),
            token.name.as_str(),
            &format!("{:#x}", token.address),
            &token.decimals.to_string(),
            &amount(token.own_balance, token.decimals),
            &token.own_balance.to_string(),
            &token.total_supply.to_string(),
            status(token),
        ]);
    }

    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

pub fn format_transactions(transactions: &[TransactionRecord], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if transactions.is_empty() {
                return "No transactions tracked.".to_string();
            }
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec!["Tx Hash", "Status", "Block", "Gas Used"]);

            for tx in transactions {
                table.add_row(vec![
                    Cell::new(format_tx_hash(&format!("{:#x}", tx.hash))),
                    Cell::new(format!("{:?}", tx.status)),
                    Cell::new(
                        tx.receipt
                            .as_ref()
                            .and_then(|r| r.block_number)
                            .map_or("N/A".to_string(), |b| b.to_string()),
                    ),
                    Cell::new(
                        tx.receipt
                            .as_ref()
                            .map_or("N/A".to_string(), |r| r.gas_used.to_string()),
                    ),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            serde_json::to_string_pretty(transactions).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["transaction_hash", "status", "block_number", "gas_used"]);
            for tx in transactions {
                let _ = wtr.write_record([
                    format!("{:#x}", tx.hash),
                    format!("{:?}", tx.status).to_lowercase(),
                    tx.receipt
                        .as_ref()
                        .and_then(|r| r.block_number)
                        .map_or(String::new(), |b| b.to_string()),
                    tx.receipt
                        .as_ref()
                        .map_or(String::new(), |r| r.gas_used.to_string()),
                ]);
            }
            String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
        }
    }
}

fn format_tx_hash(hash: &str) -> String {
    if hash.len() <= 12 {
        return hash.to_string();
    }
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{NativeCurrency, TokenDescriptor};
    use crate::wallet::WalletSnapshot;
    use alloy_primitives::{Address, B256};

    fn state() -> ButlerState {
        let mut state = ButlerState::default();
        let wallet = WalletSnapshot::watch_only(
            Address::repeat_byte(0xaa),
            U256::from(1_500_000_000_000_000_000u128),
            "mainnet",
        );
        let native = TokenRecord::native(&NativeCurrency::default(), &wallet);
        let token = TokenRecord::from_descriptor(&TokenDescriptor {
            address: Address::repeat_byte(1),
            decimals: 6,
            symbol: "USDC".to_string(),
        });
        state.tokens.insert(native.address, native);
        state.tokens.insert(token.address, token);
        state.tokens_initialized = true;
        state
    }

    #[test]
    fn native_token_is_listed_first() {
        let state = state();
        let symbols: Vec<_> = sorted_tokens(&state).iter().map(|t| t.symbol.clone()).collect();
        assert_eq!(symbols, vec!["ETH", "USDC"]);
    }

    #[test]
    fn csv_has_header_and_one_row_per_token() {
        let csv = format_tokens(&state(), &OutputFormat::Csv);
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("symbol,name,address"));
        assert!(lines[1].contains("1.500000000000000000"));
        assert!(lines[2].ends_with("uninitialized"));
    }

    #[test]
    fn json_lists_tokens() {
        let json = format_tokens(&state(), &OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(2));
        assert_eq!(parsed[0]["native"], true);
    }

    #[test]
    fn short_hashes_are_not_truncated() {
        assert_eq!(format_tx_hash("0x1234"), "0x1234");
        let long = format!("{:#x}", B256::repeat_byte(0xab));
        assert_eq!(format_tx_hash(&long), "0xabab...abab");
    }

    #[test]
    fn output_format_defaults_to_table() {
        assert_eq!(OutputFormat::from("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from("whatever"), OutputFormat::Table);
    }
}
