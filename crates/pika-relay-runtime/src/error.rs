//! Runtime errors

use std::time::Duration;

/// Coarse error classes.
///
/// Callers that only need to decide "retry, report or give up" can match on
/// [`Error::kind`] instead of every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed URL, event, filter or frame supplied by the caller or a relay
    Input,
    /// Socket or relay connection state
    Transport,
    /// NIP-11 / NIP-42 relay policy
    Policy,
    /// Cancellation or timeout of a long-running operation
    Expected,
    /// API misuse
    Usage,
    /// Broken internal invariant
    Internal,
}

/// Relay runtime error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Relay URL is not a valid `ws://` or `wss://` URL
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    /// Event failed shape, id or signature checks
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    /// Filter could not be parsed or is unusable
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    /// Frame is not a recognizable NIP-01 envelope
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    /// WebSocket handshake or transport failure
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Operation needs a connected relay
    #[error("relay not connected")]
    NotConnected,
    /// Connection dropped while the operation was in flight
    #[error("relay disconnected")]
    Disconnected,
    /// Connect attempted before the backoff window elapsed
    #[error("relay in backoff, retry in {0:?}")]
    Backoff(Duration),
    /// Relay requires NIP-42 authentication first
    #[error("relay requires authentication")]
    AuthRequired,
    /// Relay rejected our AUTH event
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Relay requires payment
    #[error("relay requires payment")]
    PaymentRequired,
    /// Relay's advertised `max_subscriptions` reached
    #[error("subscription limit reached ({0})")]
    SubscriptionLimit(u64),
    /// Serialized frame exceeds the relay's `max_message_length`
    #[error("message too large: {size} > {max}")]
    MessageTooLarge {
        /// Serialized size
        size: usize,
        /// Advertised limit
        max: u64,
    },
    /// Relay closed the request with a CLOSED frame
    #[error("closed by relay: {0}")]
    Closed(String),
    /// Outgoing queue full; non-blocking write rejected
    #[error("send queue full")]
    QueueFull,
    /// Operation cancelled through its context
    #[error("cancelled")]
    Cancelled,
    /// Operation timed out
    #[error("timeout")]
    Timeout,
    /// API misuse, e.g. firing a subscription twice
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Taxonomy class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_)
            | Self::InvalidEvent(_)
            | Self::InvalidFilter(_)
            | Self::InvalidEnvelope(_) => ErrorKind::Input,
            Self::ConnectionFailed(_)
            | Self::NotConnected
            | Self::Disconnected
            | Self::Backoff(_)
            | Self::QueueFull => ErrorKind::Transport,
            Self::AuthRequired
            | Self::AuthFailed(_)
            | Self::Closed(_)
            | Self::PaymentRequired
            | Self::SubscriptionLimit(_)
            | Self::MessageTooLarge { .. } => ErrorKind::Policy,
            Self::Cancelled | Self::Timeout => ErrorKind::Expected,
            Self::InvalidState(_) => ErrorKind::Usage,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl Error {
    /// Maps a CLOSED reason to an error, honoring the NIP-01 prefixes.
    pub fn from_closed_reason(reason: &str) -> Self {
        match reason.split_once(':').map(|(prefix, _)| prefix.trim()) {
            Some("auth-required") => Self::AuthRequired,
            Some("restricted") => Self::AuthFailed(reason.to_string()),
            _ => Self::Closed(reason.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidEnvelope(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

/// Runtime result
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(Error::InvalidUrl("x".into()).kind(), ErrorKind::Input);
        assert_eq!(Error::NotConnected.kind(), ErrorKind::Transport);
        assert_eq!(Error::SubscriptionLimit(2).kind(), ErrorKind::Policy);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Expected);
        assert_eq!(
            Error::InvalidState("fired".into()).kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn closed_reasons_map_by_prefix() {
        assert_eq!(
            Error::from_closed_reason("auth-required: sign in"),
            Error::AuthRequired
        );
        assert!(matches!(
            Error::from_closed_reason("restricted: members only"),
            Error::AuthFailed(_)
        ));
        assert_eq!(
            Error::from_closed_reason("rate-limited: slow down"),
            Error::Closed("rate-limited: slow down".into())
        );
    }

    #[test]
    fn json_errors_become_invalid_envelope() {
        let err: Error = serde_json::from_str::<serde_json::Value>("[")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::InvalidEnvelope(_)));
    }
}
