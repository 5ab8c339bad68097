//! The reconciliation service: one loop owning bootstrap, scheduling and the
//! transaction subscription for the lifetime of a run.

use alloy_primitives::B256;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::bootstrap::BootstrapInitializer;
use crate::connector::ChainConnector;
use crate::observer::{DEFAULT_EVENT_QUEUE_CAPACITY, TransactionObserver};
use crate::scheduler::TokenRefreshScheduler;
use crate::store::{Action, StateStore};
use crate::token::NativeCurrency;
use crate::transaction::{TransactionEvent, TransactionRecord};
use crate::wallet::{WalletProvider, WalletSnapshot};

const DEFAULT_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ButlerOptions {
    pub native: NativeCurrency,
    pub event_queue_capacity: usize,
    /// Housekeeping period: retries a failed bootstrap.
    pub tick: Duration,
    /// When set, every token is invalidated on this period once settled.
    pub poll_interval: Option<Duration>,
}

impl Default for ButlerOptions {
    fn default() -> Self {
        ButlerOptions {
            native: NativeCurrency::default(),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            tick: DEFAULT_TICK,
            poll_interval: None,
        }
    }
}

pub struct Butler<C, W> {
    store: StateStore,
    connector: Arc<C>,
    bootstrap: BootstrapInitializer<C>,
    scheduler: TokenRefreshScheduler<C, W>,
    observer: Option<TransactionObserver>,
    options: ButlerOptions,
}

impl<C: ChainConnector, W: WalletProvider> Butler<C, W> {
    pub fn new(
        store: StateStore,
        connector: Arc<C>,
        wallet_provider: Arc<W>,
        options: ButlerOptions,
    ) -> Self {
        Butler {
            bootstrap: BootstrapInitializer::new(Arc::clone(&connector), options.native.clone()),
            scheduler: TokenRefreshScheduler::new(
                store.clone(),
                Arc::clone(&connector),
                wallet_provider,
                options.native.clone(),
            ),
            store,
            connector,
            observer: None,
            options,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn connect_wallet(&self, wallet: WalletSnapshot) {
        info!(wallet = %wallet.address, network = %wallet.network, "wallet connected");
        self.store.dispatch(Action::WalletUpdate(Some(wallet)));
    }

    pub fn disconnect_wallet(&self) {
        info!("wallet disconnected");
        self.store.dispatch(Action::WalletUpdate(None));
    }

    /// Start tracking `hash`; later events for it invalidate the token collection.
    pub fn track_transaction(&self, hash: B256) {
        if self.store.read(|state| state.is_tracked(&hash)) {
            return;
        }
        debug!(tx = %hash, "tracking transaction");
        self.store.dispatch(Action::TransactionUpdate(TransactionRecord::from(
            TransactionEvent::pending(hash),
        )));
    }

    /// Register with the connector as its transaction observer. Events
    /// published from now on are queued for [`run`](Self::run); calling this
    /// again while subscribed does nothing.
    pub fn subscribe_transactions(&mut self) {
        if self.observer.is_none() {
            self.observer = Some(TransactionObserver::register(
                self.store.clone(),
                self.connector.as_ref(),
                self.options.event_queue_capacity,
            ));
        }
    }

    /// One reconciliation pass: bootstrap if due, then schedule stale tokens.
    pub async fn sync(&mut self) {
        if let Err(e) = self.bootstrap.run(&self.store).await {
            error!(error = %e, "bootstrap failed");
        }
        self.scheduler.schedule();
    }

    /// Run until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut changes = self.store.subscribe();
        self.subscribe_transactions();
        let mut observer = self.observer.take();
        let mut tick = interval(self.options.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = self.options.poll_interval.map(|period| {
            let mut poll = interval(period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll
        });
        tokio::pin!(shutdown);

        info!("butler started");
        self.sync().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    changes.borrow_and_update();
                    self.sync().await;
                }
                Some(outcome) = self.scheduler.next_completion() => {
                    self.scheduler.complete(outcome);
                }
                event = next_event(&mut observer) => match event {
                    Some(event) => {
                        if let Some(active) = observer.as_ref() {
                            active.handle(event);
                        }
                    }
                    None => {
                        warn!("transaction observer superseded, no longer receiving events");
                        observer = None;
                    }
                },
                _ = tick.tick() => {
                    if !self.store.read(|state| state.tokens_initialized) {
                        self.sync().await;
                    }
                }
                _ = next_poll(&mut poll) => {
                    if self.store.read(|state| state.is_settled()) {
                        debug!("periodic invalidation");
                        self.store.dispatch(Action::TokenInvalidate);
                    }
                }
            }
        }

        if observer.is_some() {
            TransactionObserver::deregister(self.connector.as_ref());
        }
        self.scheduler.cancel_all();
        info!("butler stopped");
    }
}

async fn next_event(observer: &mut Option<TransactionObserver>) -> Option<TransactionEvent> {
    match observer.as_mut() {
        Some(observer) => observer.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_poll(poll: &mut Option<tokio::time::Interval>) {
    match poll.as_mut() {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves once every token in `store` has settled.
pub async fn wait_until_settled(store: &StateStore) {
    let mut changes = store.subscribe();
    loop {
        if store.read(|state| state.is_settled()) {
            return;
        }
        if changes.changed().await.is_err() {
            return;
        }
    }
}
