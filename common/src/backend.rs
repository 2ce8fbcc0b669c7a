use serde_json::Value;

use crate::{error::SyncError, stream::RawStreamEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Ready,
    Rejected(String),
}

/// Primitives of the remote real-time store. Implementations own transport,
/// authentication tokens and TLS.
pub trait RemoteBackend {
    /// Starts (or restarts) authentication. Does not wait for completion.
    fn begin(&mut self);

    fn auth_state(&mut self) -> AuthState;

    fn get(&mut self, path: &str) -> Result<Value, SyncError>;

    fn set(&mut self, path: &str, value: &Value) -> Result<(), SyncError>;

    /// Opens a push channel on `path`, replacing any previous one.
    fn open_stream(&mut self, path: &str) -> Result<(), SyncError>;

    /// Next buffered stream notification, if any. Never blocks.
    fn poll_stream(&mut self) -> Option<RawStreamEvent>;
}
