//! In-process state container: actions are applied under one lock and every
//! applied action bumps a version observers can wait on.

use alloy_primitives::{Address, B256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use crate::token::{TokenPatch, TokenRecord};
use crate::transaction::TransactionRecord;
use crate::wallet::WalletSnapshot;

#[derive(Debug, Clone, Default)]
pub struct ButlerState {
    pub tokens: BTreeMap<Address, TokenRecord>,
    pub tokens_initialized: bool,
    /// Bumped each time the token collection is replaced or reset.
    pub session: u64,
    pub wallet: Option<WalletSnapshot>,
    pub transactions: Vec<TransactionRecord>,
}

impl ButlerState {
    pub fn token(&self, address: &Address) -> Option<&TokenRecord> {
        self.tokens.get(address)
    }

    pub fn transaction(&self, hash: &B256) -> Option<&TransactionRecord> {
        self.transactions.iter().find(|tx| tx.hash == *hash)
    }

    pub fn is_tracked(&self, hash: &B256) -> bool {
        self.transaction(hash).is_some()
    }

    /// No token is waiting for, or running, a refresh.
    pub fn is_settled(&self) -> bool {
        self.tokens_initialized
            && self
                .tokens
                .values()
                .all(|token| !token.loading && !token.is_stale())
    }

    fn reset_tokens(&mut self) {
        self.tokens.clear();
        self.tokens_initialized = false;
        self.session += 1;
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    TokenInit(Vec<TokenRecord>),
    TokenUpdate(Vec<TokenPatch>),
    /// Result of a refresh started in `session`. Dropped as a whole when the
    /// session has moved on or `wallet` no longer matches the connected
    /// address; patches for addresses missing from the collection are ignored.
    TokenRefresh {
        session: u64,
        wallet: Option<WalletSnapshot>,
        patches: Vec<TokenPatch>,
    },
    TokenInvalidate,
    WalletUpdate(Option<WalletSnapshot>),
    TransactionUpdate(TransactionRecord),
}

impl Action {
    fn kind(&self) -> &'static str {
        match self {
            Action::TokenInit(_) => "token/init",
            Action::TokenUpdate(_) => "token/update",
            Action::TokenRefresh { .. } => "token/refresh",
            Action::TokenInvalidate => "token/invalidate",
            Action::WalletUpdate(_) => "wallet/update",
            Action::TransactionUpdate(_) => "transaction/update",
        }
    }
}

#[derive(Clone)]
pub struct StateStore {
    state: Arc<Mutex<ButlerState>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for StateStore {
    fn default() -> Self {
        StateStore::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        StateStore {
            state: Arc::new(Mutex::new(ButlerState::default())),
            version: Arc::new(version),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ButlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the whole state.
    pub fn state(&self) -> ButlerState {
        self.lock().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ButlerState) -> R) -> R {
        f(&self.lock())
    }

    /// Receiver that is marked changed after every dispatch.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn dispatch(&self, action: Action) {
        let kind = action.kind();
        {
            let mut state = self.lock();
            reduce(&mut state, action);
        }
        self.version.send_modify(|version| *version += 1);
        debug!(action = kind, "state updated");
    }
}

fn reduce(state: &mut ButlerState, action: Action) {
    match action {
        Action::TokenInit(records) => {
            state.tokens = records
                .into_iter()
                .map(|record| (record.address, record))
                .collect();
            state.tokens_initialized = true;
            state.session += 1;
        }
        Action::TokenUpdate(patches) => {
            for patch in patches {
                let record = state
                    .tokens
                    .entry(patch.address)
                    .or_insert_with(|| TokenRecord::placeholder(patch.address));
                patch.apply_to(record);
            }
        }
        Action::TokenRefresh {
            session,
            wallet,
            patches,
        } => {
            if session != state.session {
                debug!(session, current = state.session, "dropping refresh from old session");
                return;
            }
            if let Some(wallet) = wallet {
                let same_wallet = state
                    .wallet
                    .as_ref()
                    .is_some_and(|current| current.address == wallet.address);
                if !same_wallet {
                    debug!(wallet = %wallet.address, "dropping refresh for a replaced wallet");
                    return;
                }
                state.wallet = Some(wallet);
            }
            for patch in patches {
                if let Some(record) = state.tokens.get_mut(&patch.address) {
                    patch.apply_to(record);
                }
            }
        }
        Action::TokenInvalidate => {
            for record in state.tokens.values_mut() {
                record.dirty = true;
            }
        }
        Action::WalletUpdate(Some(wallet)) => {
            let same_wallet = state
                .wallet
                .as_ref()
                .is_some_and(|current| current.address == wallet.address);
            if !same_wallet && state.tokens_initialized {
                state.reset_tokens();
            }
            state.wallet = Some(wallet);
        }
        Action::WalletUpdate(None) => {
            state.wallet = None;
            state.reset_tokens();
        }
        Action::TransactionUpdate(record) => {
            match state.transactions.iter_mut().find(|tx| tx.hash == record.hash) {
                Some(existing) => *existing = record,
                None => state.transactions.push(record),
            }
        }
    }
}
