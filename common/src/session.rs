use crate::types::DeviceStatus;

/// Transient connectivity flags for one boot cycle. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivitySession {
    pub is_network_joined: bool,
    pub is_backend_ready: bool,
    pub is_stream_live: bool,
    pub last_liveness_ms: Option<u64>,
    /// Last status successfully written to the backend.
    pub status: Option<DeviceStatus>,
}

impl ConnectivitySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn liveness_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        self.last_liveness_ms
            .map(|last| now_ms.saturating_sub(last) >= interval_ms)
            .unwrap_or(true)
    }
}
