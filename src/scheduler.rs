//! Decides which tokens need a refresh and runs one task per stale token.
//!
//! A token is stale when it was never initialized or has been marked dirty.
//! Before a refresh task is spawned the token is flipped to
//! `loading=true, dirty=false, initialized=true` and its address enters the
//! in-flight map; further passes skip it until the task's outcome has been
//! merged back by [`TokenRefreshScheduler::complete`].

use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connector::ChainConnector;
use crate::error::{ButlerError, ButlerResult};
use crate::reconciler::BalanceReconciler;
use crate::store::{Action, StateStore};
use crate::token::{NativeCurrency, TokenPatch, TokenRecord};
use crate::wallet::{WalletProvider, WalletSnapshot};

/// Result of one refresh task.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub address: Address,
    pub session: u64,
    pub result: ButlerResult<Refreshed>,
}

#[derive(Debug)]
pub struct Refreshed {
    pub record: TokenRecord,
    /// New wallet snapshot read by a native-currency refresh.
    pub wallet: Option<WalletSnapshot>,
}

struct InFlight {
    session: u64,
    handle: JoinHandle<()>,
}

pub struct TokenRefreshScheduler<C, W> {
    store: StateStore,
    reconciler: BalanceReconciler<C>,
    wallet_provider: Arc<W>,
    native: NativeCurrency,
    session: u64,
    in_flight: HashMap<Address, InFlight>,
    done_tx: mpsc::UnboundedSender<RefreshOutcome>,
    done_rx: mpsc::UnboundedReceiver<RefreshOutcome>,
}

impl<C: ChainConnector, W: WalletProvider> TokenRefreshScheduler<C, W> {
    pub fn new(
        store: StateStore,
        connector: Arc<C>,
        wallet_provider: Arc<W>,
        native: NativeCurrency,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        TokenRefreshScheduler {
            store,
            reconciler: BalanceReconciler::new(connector),
            wallet_provider,
            native,
            session: 0,
            in_flight: HashMap::new(),
            done_tx,
            done_rx,
        }
    }

    pub fn is_in_flight(&self, address: &Address) -> bool {
        self.in_flight.contains_key(address)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Start a refresh for every stale token that is not already in flight.
    /// Returns the addresses that got a new task.
    pub fn schedule(&mut self) -> Vec<Address> {
        let (session, initialized, stale, wallet) = self.store.read(|state| {
            let stale: Vec<TokenRecord> = state
                .tokens
                .values()
                .filter(|token| token.is_stale())
                .cloned()
                .collect();
            (
                state.session,
                state.tokens_initialized,
                stale,
                state.wallet.clone(),
            )
        });

        if session != self.session {
            self.cancel_all();
            self.session = session;
        }
        if !initialized {
            return Vec::new();
        }

        let stale: Vec<TokenRecord> = stale
            .into_iter()
            .filter(|token| !self.in_flight.contains_key(&token.address))
            .collect();
        if stale.is_empty() {
            return Vec::new();
        }

        self.store.dispatch(Action::TokenRefresh {
            session,
            wallet: None,
            patches: stale
                .iter()
                .map(|token| TokenPatch::begin_refresh(token.address))
                .collect(),
        });

        let mut scheduled = Vec::with_capacity(stale.len());
        for token in stale {
            let address = token.address;
            let handle = self.spawn_refresh(token, wallet.clone());
            self.in_flight.insert(address, InFlight { session, handle });
            scheduled.push(address);
        }

        debug!(
            count = scheduled.len(),
            in_flight = self.in_flight.len(),
            session,
            "scheduled token refreshes"
        );
        scheduled
    }

    fn spawn_refresh(&self, token: TokenRecord, wallet: Option<WalletSnapshot>) -> JoinHandle<()> {
        let address = token.address;
        let session = self.session;
        let reconciler = self.reconciler.clone();
        let wallet_provider = Arc::clone(&self.wallet_provider);
        let native = self.native.clone();
        let done = self.done_tx.clone();

        tokio::spawn(async move {
            let result = if token.is_native_currency {
                refresh_native(wallet_provider.as_ref(), &native, &token, wallet).await
            } else {
                reconciler
                    .reconcile(&token, wallet.map(|w| w.address))
                    .await
                    .map(|record| Refreshed {
                        record,
                        wallet: None,
                    })
            };

            // Receiver only goes away with the scheduler itself.
            let _ = done.send(RefreshOutcome {
                address,
                session,
                result,
            });
        })
    }

    /// Wait for the next finished refresh task.
    pub async fn next_completion(&mut self) -> Option<RefreshOutcome> {
        self.done_rx.recv().await
    }

    /// Merge a finished refresh into the store.
    ///
    /// Failures only clear `loading`: the token stays `initialized` and is not
    /// retried until something marks it dirty again.
    pub fn complete(&mut self, outcome: RefreshOutcome) {
        let RefreshOutcome {
            address,
            session,
            result,
        } = outcome;

        if self
            .in_flight
            .get(&address)
            .is_some_and(|entry| entry.session == session)
        {
            self.in_flight.remove(&address);
        }

        if session != self.store.read(|state| state.session) {
            debug!(
                error = %ButlerError::StaleRace { address, session },
                "discarding refresh result"
            );
            return;
        }

        let (wallet, patch) = match result {
            Ok(Refreshed { record, wallet }) => {
                debug!(token = %address, symbol = %record.symbol, "token refreshed");
                (wallet, TokenPatch::refreshed(record))
            }
            Err(ButlerError::MissingWallet) => {
                debug!(token = %address, "native refresh skipped, no private key");
                (None, TokenPatch::refresh_failed(address))
            }
            Err(e) => {
                warn!(token = %address, error = %e, "token refresh failed");
                (None, TokenPatch::refresh_failed(address))
            }
        };

        // The store re-checks session and wallet under its lock.
        self.store.dispatch(Action::TokenRefresh {
            session,
            wallet,
            patches: vec![patch],
        });
    }

    /// Abort every running refresh.
    pub fn cancel_all(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(count = self.in_flight.len(), "cancelling in-flight refreshes");
        }
        for (_, entry) in self.in_flight.drain() {
            entry.handle.abort();
        }
    }
}

async fn refresh_native<W: WalletProvider>(
    wallet_provider: &W,
    native: &NativeCurrency,
    token: &TokenRecord,
    wallet: Option<WalletSnapshot>,
) -> ButlerResult<Refreshed> {
    let Some(wallet) = wallet else {
        return Err(ButlerError::MissingWallet);
    };
    let Some(private_key) = wallet.private_key.as_ref() else {
        return Err(ButlerError::MissingWallet);
    };

    let snapshot = wallet_provider
        .reconnect(private_key, &wallet.network)
        .await
        .map_err(|e| ButlerError::fetch("wallet snapshot", e))?;

    let mut record = TokenRecord::native(native, &snapshot);
    record.list_priority = token.list_priority;
    Ok(Refreshed {
        record,
        wallet: Some(snapshot),
    })
}
