use alloy_primitives::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ButlerError {
    /// A chain read failed, either at the transport or while decoding its result.
    #[error("failed to fetch {what}: {source:#}")]
    FetchFailure {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    /// Native currency refresh requested while no private key is held.
    #[error("no private key available to refresh the native currency")]
    MissingWallet,

    /// Refresh finished after the wallet session that requested it was replaced.
    #[error("refresh of {address} belongs to superseded session {session}")]
    StaleRace { address: Address, session: u64 },
}

impl ButlerError {
    pub fn fetch(what: impl Into<String>, source: anyhow::Error) -> Self {
        ButlerError::FetchFailure {
            what: what.into(),
            source,
        }
    }
}

pub type ButlerResult<T> = Result<T, ButlerError>;
