//! Chain access consumed by the butler.

pub mod evm;
pub mod memory;

use alloy_primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::contract_params::ParamEntry;
use crate::token::{PoolRef, TokenDescriptor};
use crate::transaction::TransactionEvent;

pub use evm::{EvmConnector, EvmWallet};
pub use memory::{InMemoryConnector, StaticWallet};

/// Raw balance table of a token contract: holder address text -> decimal text.
pub type BalanceTable = BTreeMap<String, String>;

/// Sending half of a transaction-event subscription.
pub type ObserverSender = mpsc::Sender<TransactionEvent>;

#[async_trait]
pub trait ChainConnector: Send + Sync + 'static {
    async fn list_known_tokens(&self) -> Result<Vec<TokenDescriptor>>;

    async fn get_pool_for(&self, token: Address) -> Result<Option<PoolRef>>;

    async fn get_init_params(&self, token: Address) -> Result<Vec<ParamEntry>>;

    async fn get_balance_table(&self, token: Address) -> Result<BalanceTable>;

    /// Install `observer` as the only receiver of transaction events.
    /// `None` removes the current one.
    fn register_transaction_observer(&self, observer: Option<ObserverSender>);
}

/// Holds the single registered transaction observer of a connector.
///
/// Installing a new sender drops the previous one, which closes the previous
/// subscriber's channel.
#[derive(Default)]
pub struct ObserverSlot {
    current: Mutex<Option<ObserverSender>>,
}

impl ObserverSlot {
    pub fn new() -> Self {
        ObserverSlot::default()
    }

    pub fn replace(&self, observer: Option<ObserverSender>) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            debug!(
                registered = observer.is_some(),
                "superseding transaction observer"
            );
        }
        *current = observer;
    }

    pub fn is_registered(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Deliver `event` to the registered observer, if any. Returns whether it was
    /// queued.
    pub fn publish(&self, event: TransactionEvent) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = current.as_ref() else {
            debug!(hash = %event.hash, "no transaction observer registered, dropping event");
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(hash = %event.hash, "transaction observer queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("transaction observer went away, clearing registration");
                *current = None;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    #[tokio::test]
    async fn replacing_observer_closes_previous_channel() {
        let slot = ObserverSlot::new();
        let (first_tx, mut first_rx) = mpsc::channel(4);
        let (second_tx, mut second_rx) = mpsc::channel(4);

        slot.replace(Some(first_tx));
        slot.replace(Some(second_tx));

        assert!(slot.publish(TransactionEvent::pending(B256::repeat_byte(1))));
        assert!(first_rx.recv().await.is_none());
        assert_eq!(
            second_rx.recv().await.map(|e| e.hash),
            Some(B256::repeat_byte(1))
        );
    }

    #[test]
    fn publish_without_observer_is_dropped() {
        let slot = ObserverSlot::new();
        assert!(!slot.publish(TransactionEvent::pending(B256::ZERO)));
    }

    #[test]
    fn closed_receiver_clears_registration() {
        let slot = ObserverSlot::new();
        let (tx, rx) = mpsc::channel(1);
        slot.replace(Some(tx));
        drop(rx);

        assert!(!slot.publish(TransactionEvent::pending(B256::ZERO)));
        assert!(!slot.is_registered());
    }

    #[test]
    fn full_queue_drops_event_but_keeps_observer() {
        let slot = ObserverSlot::new();
        let (tx, _rx) = mpsc::channel(1);
        slot.replace(Some(tx));

        assert!(slot.publish(TransactionEvent::pending(B256::repeat_byte(1))));
        assert!(!slot.publish(TransactionEvent::pending(B256::repeat_byte(2))));
        assert!(slot.is_registered());
    }
}
