// ABOUTME: Error taxonomy for change polling - invalid argument, transport, translation
// ABOUTME: Only transport failures are retryable; no error ever commits a watermark

use thiserror::Error;

use super::advancer::CyclePhase;
use super::token::WatermarkError;
use crate::directory::StoreError;
use crate::schema::TranslationError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Caller contract violation, raised before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("error searching for changes ({filter}): {source}")]
    Transport {
        filter: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to translate entry {dn}: {source}")]
    Translation {
        dn: String,
        #[source]
        source: TranslationError,
    },

    #[error("change handler failed at {context}: {source}")]
    Handler {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("cannot {action} while the polling cycle is {phase}")]
    CycleState {
        action: &'static str,
        phase: CyclePhase,
    },
}

impl SyncError {
    /// True when a later poll from the last committed watermark may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }

    pub(crate) fn transport(filter: &str, source: StoreError) -> Self {
        SyncError::Transport {
            filter: filter.to_string(),
            source,
        }
    }

    pub(crate) fn handler(context: &str, source: anyhow::Error) -> Self {
        SyncError::Handler {
            context: context.to_string(),
            source: source.into(),
        }
    }
}

impl From<WatermarkError> for SyncError {
    fn from(err: WatermarkError) -> Self {
        SyncError::InvalidArgument(err.to_string())
    }
}
