use thiserror::Error;

/// Backend credential / readiness failures raised while connecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The backend refused the device credentials. Fatal for this boot cycle.
    #[error("backend rejected device credentials: {0}")]
    Rejected(String),
    #[error("backend not ready after {attempts} attempts")]
    NotReady { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection lost")]
    ConnectionLost,
    #[error("request timed out")]
    Timeout,
    #[error("backend not ready")]
    NotReady,
    #[error("backend rejected request ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("unexpected payload at `{path}`: {reason}")]
    Decode { path: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Refused / lost connections are what flip the session to not-ready.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionRefused | Self::ConnectionLost)
    }

    /// Whether repeating the same request could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. } | Self::Decode { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("no wifi credentials")]
    MissingCredentials,
    #[error("network `{ssid}` not joined after {attempts} attempts")]
    Exhausted { ssid: String, attempts: u32 },
    #[error("wifi driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("record magic mismatch (found {found:#010x})")]
    BadMagic { found: u32 },
    #[error("record truncated: {len} bytes")]
    Truncated { len: usize },
    #[error("field `{field}` is not valid utf-8")]
    InvalidUtf8 { field: &'static str },
    #[error("field `{field}` exceeds {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Rejections of a provisioning form submission, reported back to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("All fields except password are required")]
    MissingField,
    #[error("{0}")]
    Invalid(ConfigError),
    #[error("Device is not accepting configuration")]
    NotAccepting,
    #[error("WiFi connection failed")]
    JoinFailed(JoinError),
}

impl SubmissionError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingField | Self::Invalid(_) => 400,
            Self::NotAccepting => 409,
            Self::JoinFailed(_) => 503,
        }
    }
}
