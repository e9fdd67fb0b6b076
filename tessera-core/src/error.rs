//! Error Types
//!
//! Every fallible operation in the crate reports through [`StateError`].
//!
//! The steady-state API (`Signal::set`, `PubSub::emit`, the various
//! `cleanup` calls) never returns an error. Subscriber failures there are
//! isolated and logged. `StateError` is reserved for registration-time
//! problems and for the preserve/restore path, where it is also carried as a
//! message on the result reports.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors produced by the signal registry and the state preservation manager.
#[derive(Debug, Error)]
pub enum StateError {
    /// `restore_state` was called without a held snapshot.
    #[error("no snapshot available to restore (preserve_state was never called or the snapshot was discarded)")]
    NoSnapshot,

    /// The held snapshot is older than its time-to-live.
    #[error("snapshot expired: age {age_ms}ms exceeds ttl {ttl_ms}ms")]
    SnapshotExpired { age_ms: u64, ttl_ms: u64 },

    /// A key is already registered with a different value type.
    #[error("signal '{key}' holds {found}, requested {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A signal value could not be deep-copied into a snapshot.
    #[error("failed to capture signal '{key}': {source}")]
    Capture {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A captured value could not be written back into a signal.
    #[error("failed to restore signal '{key}': {source}")]
    Restore {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A computed signal's compute function panicked before producing a value.
    #[error("compute function failed: {message}")]
    Compute { message: String },

    /// Snapshot binary encoding or decoding failed.
    #[error("snapshot codec error: {0}")]
    Codec(String),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<rmp_serde::encode::Error> for StateError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        StateError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StateError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        StateError::Codec(err.to_string())
    }
}

/// Render a caught panic payload as a log-friendly string.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
