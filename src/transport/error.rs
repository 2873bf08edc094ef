use std::time::Duration;

use thiserror::Error;

use super::messaging::MessagingError;

/// Terminal outcome of a request that did not produce a valid response.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to send request to {topic}, no remote address found")]
    NoRoute { topic: String },
    #[error("request to {topic} got an invalid response")]
    InvalidResponse { topic: String },
    #[error("failed to reach handler of {topic}: {source}")]
    Connectivity {
        topic: String,
        #[source]
        source: MessagingError,
    },
    #[error("request to {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    #[error(transparent)]
    Substrate(MessagingError),
    /// The client went away before the request could be resolved.
    #[error("client transport is closed")]
    Closed,
}

/// What to do about a failed exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Transient; worth another attempt if the request allows retries.
    Retry,
    /// Surface the error to the caller as is.
    Fail,
}

/// Refused connections and missing handlers clear up on their own once the
/// node (or its handler) comes up. Anything else might hide a real bug, so it
/// is never retried.
pub fn classify(error: &MessagingError) -> Disposition {
    match error {
        MessagingError::ConnectionRefused { .. }
        | MessagingError::NoRemoteHandler { .. } => Disposition::Retry,
        MessagingError::RemoteHandlerFailure(_)
        | MessagingError::Timeout(_)
        | MessagingError::Other(_) => Disposition::Fail,
    }
}

impl Error {
    /// Terminal error for an exchange that failed with `error` and will not
    /// be retried.
    pub(crate) fn from_messaging(topic: &str, error: MessagingError) -> Self {
        match classify(&error) {
            Disposition::Retry => Self::Connectivity {
                topic: topic.to_owned(),
                source: error,
            },
            Disposition::Fail => Self::Substrate(error),
        }
    }
}
