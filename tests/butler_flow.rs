use alloy_primitives::{Address, B256, U256, address};
use std::sync::Arc;
use std::time::Duration;
use token_butler::butler::{Butler, ButlerOptions, wait_until_settled};
use token_butler::connector::{InMemoryConnector, StaticWallet};
use token_butler::contract_params::ParamEntry;
use token_butler::store::{Action, ButlerState, StateStore};
use token_butler::token::{NATIVE_CURRENCY_ADDRESS, TokenDescriptor};
use token_butler::transaction::{ReceiptSummary, TransactionEvent, TransactionStatus};
use token_butler::wallet::PrivateKeyHandle;
use tokio::sync::oneshot;
use tokio::time::timeout;

const TOKEN: Address = address!("1111111111111111111111111111111111111111");
const ALICE: Address = address!("00000000000000000000000000000000000000a1");
const OTHER_WALLET: Address = address!("00000000000000000000000000000000000000b2");

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    store: StateStore,
    connector: Arc<InMemoryConnector>,
    wallet: Arc<StaticWallet>,
    butler: Butler<InMemoryConnector, StaticWallet>,
}

fn harness() -> Harness {
    let store = StateStore::new();
    let connector = Arc::new(InMemoryConnector::new());
    let wallet = Arc::new(StaticWallet::new(ALICE, U256::from(500u64)));

    connector.add_token(
        TokenDescriptor {
            address: TOKEN,
            decimals: 6,
            symbol: "USDX".to_string(),
        },
        vec![
            ParamEntry::new("name", "String", "Dollar X"),
            ParamEntry::new("symbol", "String", "USDX"),
            ParamEntry::new("decimals", "Uint32", "6"),
            ParamEntry::new("init_supply", "Uint128", "1000000"),
        ],
    );
    connector.set_balance(TOKEN, format!("{ALICE:#x}"), "42");

    let butler = Butler::new(
        store.clone(),
        Arc::clone(&connector),
        Arc::clone(&wallet),
        ButlerOptions {
            tick: Duration::from_millis(50),
            ..ButlerOptions::default()
        },
    );
    Harness {
        store,
        connector,
        wallet,
        butler,
    }
}

async fn wait_for(store: &StateStore, predicate: impl Fn(&ButlerState) -> bool) {
    let mut changes = store.subscribe();
    let waited = timeout(WAIT, async {
        while !store.read(&predicate) {
            if changes.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

fn own_balance(state: &ButlerState, token: &Address) -> Option<U256> {
    state.token(token).map(|record| record.own_balance)
}

#[tokio::test]
async fn tracked_transaction_triggers_a_second_reconciliation() {
    let Harness {
        store,
        connector,
        wallet,
        mut butler,
    } = harness();
    let hash = B256::repeat_byte(0x42);

    butler.connect_wallet(wallet.snapshot(Some(PrivateKeyHandle::new("0xkey")), "testnet"));
    butler.track_transaction(hash);

    let (stop, stopped) = oneshot::channel::<()>();
    let driver = async {
        assert!(timeout(WAIT, wait_until_settled(&store)).await.is_ok());
        let state = store.state();
        assert_eq!(own_balance(&state, &TOKEN), Some(U256::from(42u64)));
        assert_eq!(own_balance(&state, &NATIVE_CURRENCY_ADDRESS), Some(U256::from(500u64)));
        assert_eq!(state.token(&TOKEN).map(|t| t.name.as_str()), Some("Dollar X"));
        assert_eq!(
            state.token(&TOKEN).map(|t| t.total_supply),
            Some(U256::from(1_000_000u64))
        );
        assert_eq!(connector.balance_reads(&TOKEN), 1);
        assert!(connector.has_observer());

        connector.set_balance(TOKEN, format!("{ALICE:#x}"), "100");
        wallet.set_balance(U256::from(700u64));
        assert!(connector.emit(TransactionEvent {
            hash,
            status: TransactionStatus::Confirmed,
            receipt: Some(ReceiptSummary {
                block_number: Some(7),
                gas_used: 21_000,
                success: true,
            }),
        }));

        wait_for(&store, |state| {
            state.is_settled() && own_balance(state, &TOKEN) == Some(U256::from(100u64))
        })
        .await;
        let state = store.state();
        assert_eq!(own_balance(&state, &NATIVE_CURRENCY_ADDRESS), Some(U256::from(700u64)));
        assert_eq!(
            state.transaction(&hash).map(|tx| tx.status),
            Some(TransactionStatus::Confirmed)
        );
        assert_eq!(connector.balance_reads(&TOKEN), 2);

        let _ = stop.send(());
    };

    tokio::join!(
        butler.run(async {
            let _ = stopped.await;
        }),
        driver
    );
    assert!(!connector.has_observer());
}

#[tokio::test]
async fn untracked_transaction_is_recorded_without_invalidation() {
    let Harness {
        store,
        connector,
        wallet,
        mut butler,
    } = harness();
    let stranger = B256::repeat_byte(0x99);

    butler.connect_wallet(wallet.snapshot(None, "testnet"));

    let (stop, stopped) = oneshot::channel::<()>();
    let driver = async {
        assert!(timeout(WAIT, wait_until_settled(&store)).await.is_ok());

        assert!(connector.emit(TransactionEvent::pending(stranger)));
        wait_for(&store, |state| state.is_tracked(&stranger)).await;

        assert!(store.read(|state| state.is_settled()));
        assert_eq!(connector.balance_reads(&TOKEN), 1);
        let _ = stop.send(());
    };

    tokio::join!(
        butler.run(async {
            let _ = stopped.await;
        }),
        driver
    );
}

#[tokio::test]
async fn switching_wallet_reseeds_the_collection() {
    let Harness {
        store,
        connector,
        wallet,
        mut butler,
    } = harness();
    connector.set_balance(TOKEN, format!("{OTHER_WALLET:#x}"), "9");

    butler.connect_wallet(wallet.snapshot(None, "testnet"));

    let (stop, stopped) = oneshot::channel::<()>();
    let driver = async {
        assert!(timeout(WAIT, wait_until_settled(&store)).await.is_ok());
        let first_session = store.read(|state| state.session);

        let other = StaticWallet::new(OTHER_WALLET, U256::from(3u64));
        store.dispatch(Action::WalletUpdate(Some(other.snapshot(None, "testnet"))));

        wait_for(&store, |state| {
            state.session > first_session
                && state.is_settled()
                && own_balance(state, &TOKEN) == Some(U256::from(9u64))
        })
        .await;
        let state = store.state();
        assert_eq!(own_balance(&state, &NATIVE_CURRENCY_ADDRESS), Some(U256::from(3u64)));
        assert_eq!(state.tokens.len(), 2);

        let _ = stop.send(());
    };

    tokio::join!(
        butler.run(async {
            let _ = stopped.await;
        }),
        driver
    );
}

#[tokio::test]
async fn disconnecting_the_wallet_clears_tokens() {
    let Harness {
        store,
        wallet,
        mut butler,
        ..
    } = harness();

    butler.connect_wallet(wallet.snapshot(None, "testnet"));

    let (stop, stopped) = oneshot::channel::<()>();
    let driver = async {
        assert!(timeout(WAIT, wait_until_settled(&store)).await.is_ok());
        store.dispatch(Action::WalletUpdate(None));

        wait_for(&store, |state| state.tokens.is_empty()).await;
        assert!(!store.read(|state| state.tokens_initialized));
        let _ = stop.send(());
    };

    tokio::join!(
        butler.run(async {
            let _ = stopped.await;
        }),
        driver
    );
}

#[tokio::test]
async fn events_published_before_run_are_delivered() {
    let Harness {
        store,
        connector,
        wallet,
        mut butler,
    } = harness();
    let hash = B256::repeat_byte(0x17);

    butler.connect_wallet(wallet.snapshot(None, "testnet"));
    butler.track_transaction(hash);
    butler.subscribe_transactions();
    assert!(connector.has_observer());
    assert!(connector.emit(TransactionEvent {
        hash,
        status: TransactionStatus::Rejected,
        receipt: None,
    }));

    let (stop, stopped) = oneshot::channel::<()>();
    let driver = async {
        wait_for(&store, |state| {
            state.transaction(&hash).map(|tx| tx.status) == Some(TransactionStatus::Rejected)
        })
        .await;
        assert!(timeout(WAIT, wait_until_settled(&store)).await.is_ok());
        let _ = stop.send(());
    };

    tokio::join!(
        butler.run(async {
            let _ = stopped.await;
        }),
        driver
    );
    assert!(!connector.has_observer());
}
