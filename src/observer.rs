use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connector::ChainConnector;
use crate::store::{Action, StateStore};
use crate::transaction::TransactionEvent;

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 64;

/// Consumes transaction lifecycle events from a connector.
///
/// A connector keeps a single observer: registering one drops the sender held
/// for the previous registration, whose [`next_event`](Self::next_event) then
/// returns `None`.
pub struct TransactionObserver {
    store: StateStore,
    events: mpsc::Receiver<TransactionEvent>,
}

impl TransactionObserver {
    pub fn register<C: ChainConnector + ?Sized>(
        store: StateStore,
        connector: &C,
        capacity: usize,
    ) -> Self {
        let (tx, events) = mpsc::channel(capacity.max(1));
        connector.register_transaction_observer(Some(tx));
        debug!(capacity, "transaction observer registered");
        TransactionObserver { store, events }
    }

    pub fn deregister<C: ChainConnector + ?Sized>(connector: &C) {
        connector.register_transaction_observer(None);
    }

    pub async fn next_event(&mut self) -> Option<TransactionEvent> {
        self.events.recv().await
    }

    /// Record `event`; when its hash was already tracked every token is marked
    /// dirty. Returns whether the collection was invalidated.
    pub fn handle(&self, event: TransactionEvent) -> bool {
        let hash = event.hash;
        let status = event.status;
        let tracked = self.store.read(|state| state.is_tracked(&hash));

        self.store
            .dispatch(Action::TransactionUpdate(event.into_record()));

        if tracked {
            info!(tx = %hash, ?status, "tracked transaction changed, invalidating tokens");
            self.store.dispatch(Action::TokenInvalidate);
        } else {
            debug!(tx = %hash, ?status, "recorded untracked transaction");
        }
        tracked
    }
}
