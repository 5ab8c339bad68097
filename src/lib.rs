pub mod bootstrap;
pub mod butler;
pub mod config;
pub mod connector;
pub mod contract_params;
pub mod error;
pub mod events;
pub mod formatters;
pub mod observer;
pub mod reconciler;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod token;
pub mod transaction;
pub mod wallet;

pub use butler::{Butler, ButlerOptions, wait_until_settled};
pub use connector::ChainConnector;
pub use error::{ButlerError, ButlerResult};
pub use store::{Action, ButlerState, StateStore};
pub use token::{NATIVE_CURRENCY_ADDRESS, TokenRecord};
pub use wallet::{WalletProvider, WalletSnapshot};
