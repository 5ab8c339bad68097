use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptSummary {
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: B256,
    pub status: TransactionStatus,
    pub receipt: Option<ReceiptSummary>,
}

/// Lifecycle event published by a chain connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    pub hash: B256,
    pub status: TransactionStatus,
    pub receipt: Option<ReceiptSummary>,
}

impl TransactionEvent {
    pub fn pending(hash: B256) -> Self {
        TransactionEvent {
            hash,
            status: TransactionStatus::Pending,
            receipt: None,
        }
    }

    pub fn into_record(self) -> TransactionRecord {
        TransactionRecord::from(self)
    }
}

impl From<TransactionEvent> for TransactionRecord {
    fn from(event: TransactionEvent) -> Self {
        TransactionRecord {
            hash: event.hash,
            status: event.status,
            receipt: event.receipt,
        }
    }
}
