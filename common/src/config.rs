use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub liveness_interval_ms: u64,
    pub schedule_interval_ms: u64,
    pub ap_drain_grace_ms: u64,
    pub loop_delay_ms: u64,
    pub reset_hold_ms: u64,
    pub reconnect_kick_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            liveness_interval_ms: 30_000,
            schedule_interval_ms: 60_000,
            ap_drain_grace_ms: 30_000,
            loop_delay_ms: 100,
            reset_hold_ms: 5_000,
            reconnect_kick_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub wifi_join: RetryPolicy,
    pub backend_ready: RetryPolicy,
    pub write: RetryPolicy,
    pub time_sync: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            wifi_join: RetryPolicy::WIFI_JOIN,
            backend_ready: RetryPolicy::BACKEND_READY,
            write: RetryPolicy::WRITE,
            time_sync: RetryPolicy::TIME_SYNC,
        }
    }
}

/// Connection settings handed to the backend transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub database_url: String,
    pub api_key: String,
    pub device_email: String,
    pub device_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    pub provisioning_ap_ssid: String,
    pub timezone: String,
    pub reset_desired_state_on_boot: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            backend: BackendConfig::default(),
            provisioning_ap_ssid: "Homuino-Provisioning".to_string(),
            timezone: "Asia/Singapore".to_string(),
            reset_desired_state_on_boot: true,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        let timing = &mut self.timing;
        timing.poll_interval_ms = timing.poll_interval_ms.max(100);
        timing.liveness_interval_ms = timing.liveness_interval_ms.max(1_000);
        timing.schedule_interval_ms = timing.schedule_interval_ms.clamp(1_000, 60_000);
        timing.loop_delay_ms = timing.loop_delay_ms.clamp(1, 1_000);

        for policy in [
            &mut self.retry.wifi_join,
            &mut self.retry.backend_ready,
            &mut self.retry.write,
            &mut self.retry.time_sync,
        ] {
            policy.max_attempts = policy.max_attempts.max(1);
        }

        if self.provisioning_ap_ssid.trim().is_empty() {
            self.provisioning_ap_ssid = Self::default().provisioning_ap_ssid;
        }
    }
}
