use alloy_primitives::U256;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// One entry of a contract's init parameters, as returned by the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamEntry {
    #[serde(rename = "vname")]
    pub name: String,
    #[serde(rename = "type")]
    pub declared_type: String,
    pub value: String,
}

impl ParamEntry {
    pub fn new(
        name: impl Into<String>,
        declared_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        ParamEntry {
            name: name.into(),
            declared_type: declared_type.into(),
            value: value.into(),
        }
    }
}

/// Init parameters flattened to `name -> raw text`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractParams(HashMap<String, String>);

impl ContractParams {
    /// Later entries with the same name replace earlier ones.
    pub fn decode(entries: &[ParamEntry]) -> Self {
        let mut params = HashMap::with_capacity(entries.len());
        for entry in entries {
            params.insert(entry.name.clone(), entry.value.clone());
        }
        ContractParams(params)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    pub fn u8(&self, name: &str) -> Result<Option<u8>> {
        self.get(name)
            .map(|raw| {
                raw.trim()
                    .parse::<u8>()
                    .with_context(|| format!("init param {name} is not a u8: {raw}"))
            })
            .transpose()
    }

    pub fn u256(&self, name: &str) -> Result<Option<U256>> {
        self.get(name)
            .map(|raw| parse_decimal(raw).with_context(|| format!("init param {name}")))
            .transpose()
    }
}

/// Parse a base-10 unsigned integer of arbitrary size (up to 256 bits).
pub fn parse_decimal(raw: &str) -> Result<U256> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!("invalid decimal value: {:?}", raw));
    }
    U256::from_str_radix(trimmed, 10).map_err(|e| anyhow!("invalid decimal value {raw}: {e}"))
}

impl FromStr for ContractParams {
    type Err = serde_json::Error;

    /// Accepts the JSON array form `[{"vname", "type", "value"}, ...]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entries: Vec<ParamEntry> = serde_json::from_str(s)?;
        Ok(ContractParams::decode(&entries))
    }
}
