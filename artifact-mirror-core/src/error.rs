//! Error type shared by every component of the mirror.
//!
//! Provider, store and upload failures are cycle-fatal: they bubble up to the
//! scheduler, which logs them and retries on the next cycle. Archive failures
//! are absorbed by the pipelines themselves.

use std::error::Error as StdError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("provider request failed: {context}")]
    Provider {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("provider returned {status} for {url}")]
    ProviderStatus { url: String, status: u16 },

    #[error("upload of {key} failed")]
    Upload {
        key: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("metadata store error: {context}")]
    Store {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid artifact name {0:?}")]
    InvalidArtifactName(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn provider(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Provider {
            context: context.into(),
            source,
        }
    }

    pub fn store(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    pub fn upload(
        key: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Upload {
            key: key.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
