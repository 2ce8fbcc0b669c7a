pub mod backend;
pub mod config;
pub mod error;
pub mod paths;
pub mod ports;
pub mod provisioning;
pub mod reconciler;
pub mod record;
pub mod retry;
pub mod schedule;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_support;

pub use backend::{AuthState, RemoteBackend};
pub use config::{BackendConfig, RetryConfig, RuntimeConfig, TimingConfig};
pub use error::{AuthError, ConfigError, JoinError, SubmissionError, SyncError};
pub use paths::DevicePaths;
pub use ports::{Actuator, Clock, Platform, ResetInput, WifiRadio};
pub use provisioning::{ProvisioningState, ProvisioningSubmission};
pub use record::{
    ConfigStore, DeviceIdentity, NetworkCredentials, PersistedRecord, RecordStorage,
    RECORD_REGION_SIZE,
};
pub use retry::RetryPolicy;
pub use schedule::{ScheduleEntry, ScheduleMap, TimerAction, TriggerTime};
pub use stream::{RawStreamEvent, SseDecoder};
pub use supervisor::Supervisor;
pub use types::{DeviceStatus, LoopControl, StreamEvent, SwitchState};
