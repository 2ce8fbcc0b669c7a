use log::{error, info, warn};
use serde::Deserialize;

use crate::{
    error::{JoinError, SubmissionError},
    ports::{Clock, WifiRadio},
    record::{ConfigStore, DeviceIdentity, NetworkCredentials, PersistedRecord, RecordStorage},
    retry::RetryPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Unprovisioned,
    Connecting,
    Joined,
    ProvisioningBroadcast,
    ProvisioningBroadcastDraining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Idle,
    Waiting,
    /// Clients were still associated at the deadline; checked again next tick.
    Deferred { clients: usize },
    Completed,
}

/// Fields posted by the configuration form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisioningSubmission {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "deviceId")]
    pub device_id: String,
    #[serde(default, rename = "userId")]
    pub user_id: String,
    #[serde(default, rename = "userEmail")]
    pub user_email: String,
}

impl ProvisioningSubmission {
    /// Builds the record to persist once the join succeeds. The `provisioned`
    /// flag stays `false` until the access point has been shut down.
    pub fn into_record(self) -> Result<PersistedRecord, SubmissionError> {
        let required = [&self.ssid, &self.device_id, &self.user_id, &self.user_email];
        if required.iter().any(|field| field.trim().is_empty()) {
            return Err(SubmissionError::MissingField);
        }

        let record = PersistedRecord {
            identity: DeviceIdentity {
                device_id: self.device_id.trim().to_string(),
                owner_id: self.user_id.trim().to_string(),
                owner_email: self.user_email.trim().to_string(),
            },
            credentials: NetworkCredentials {
                ssid: self.ssid,
                passphrase: self.password,
            },
            provisioned: false,
        };
        record.validate().map_err(SubmissionError::Invalid)?;
        Ok(record)
    }
}

pub struct ProvisioningManager {
    state: ProvisioningState,
    ap_ssid: String,
    join_policy: RetryPolicy,
    drain_grace_ms: u64,
    ap_active: bool,
    drain_deadline_ms: Option<u64>,
}

impl ProvisioningManager {
    pub fn new(ap_ssid: impl Into<String>, join_policy: RetryPolicy, drain_grace_ms: u64) -> Self {
        Self {
            state: ProvisioningState::Unprovisioned,
            ap_ssid: ap_ssid.into(),
            join_policy,
            drain_grace_ms,
            ap_active: false,
            drain_deadline_ms: None,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn is_access_point_active(&self) -> bool {
        self.ap_active
    }

    /// Joins the stored network when the record is provisioned, otherwise (or
    /// when the join fails) starts broadcasting. Returns `true` once joined.
    pub fn boot<P>(&mut self, platform: &mut P, record: Option<&PersistedRecord>) -> bool
    where
        P: WifiRadio + Clock,
    {
        match record {
            Some(record) if record.provisioned => {
                self.state = ProvisioningState::Connecting;
                match self.join(platform, &record.credentials) {
                    Ok(()) => {
                        self.state = ProvisioningState::Joined;
                        return true;
                    }
                    Err(err) => warn!("stored network unavailable: {err}"),
                }
            }
            Some(_) => info!("stored configuration is not provisioned"),
            None => info!("no stored configuration"),
        }

        self.start_broadcast(platform);
        false
    }

    pub fn start_broadcast(&mut self, radio: &mut impl WifiRadio) {
        match radio.start_access_point(&self.ap_ssid) {
            Ok(()) => info!("provisioning access point `{}` started", self.ap_ssid),
            Err(err) => error!("failed to start provisioning access point: {err}"),
        }
        self.ap_active = true;
        self.drain_deadline_ms = None;
        self.state = ProvisioningState::ProvisioningBroadcast;
    }

    /// Handles one form submission. On success the record is persisted and
    /// the station stays joined while the access point keeps running.
    pub fn submit<P, S>(
        &mut self,
        platform: &mut P,
        store: &mut ConfigStore<S>,
        submission: ProvisioningSubmission,
    ) -> Result<PersistedRecord, SubmissionError>
    where
        P: WifiRadio + Clock,
        S: RecordStorage,
    {
        if self.state != ProvisioningState::ProvisioningBroadcast {
            return Err(SubmissionError::NotAccepting);
        }
        let record = submission.into_record()?;

        info!("joining submitted network `{}`", record.credentials.ssid);
        if let Err(err) = self.join(platform, &record.credentials) {
            warn!("submitted network not joined: {err}");
            return Err(SubmissionError::JoinFailed(err));
        }

        if let Err(err) = store.save(&record) {
            error!("failed to persist configuration: {err}");
        }
        self.state = ProvisioningState::Joined;
        Ok(record)
    }

    /// Leaves the broadcast fallback once the station reaches the stored
    /// network again, so the next `backend_ready` drains the access point.
    pub fn station_rejoined(&mut self) {
        if self.state == ProvisioningState::ProvisioningBroadcast {
            info!("station rejoined the stored network");
            self.state = ProvisioningState::Joined;
        }
    }

    /// Starts the grace window when the backend becomes ready while the
    /// access point is still up.
    pub fn backend_ready(&mut self, now_ms: u64) {
        if self.ap_active && self.state == ProvisioningState::Joined {
            info!(
                "backend ready; access point shuts down in {} ms",
                self.drain_grace_ms
            );
            self.state = ProvisioningState::ProvisioningBroadcastDraining;
            self.drain_deadline_ms = Some(now_ms + self.drain_grace_ms);
        }
    }

    /// Shuts the access point down once the grace window elapsed and no
    /// client is associated, then persists `record` as provisioned.
    pub fn poll_drain<P, S>(
        &mut self,
        platform: &mut P,
        store: &mut ConfigStore<S>,
        record: Option<&PersistedRecord>,
        now_ms: u64,
    ) -> DrainOutcome
    where
        P: WifiRadio,
        S: RecordStorage,
    {
        let Some(deadline) = self.drain_deadline_ms else {
            return DrainOutcome::Idle;
        };
        if now_ms < deadline {
            return DrainOutcome::Waiting;
        }

        let clients = platform.associated_clients();
        if clients > 0 {
            info!("{clients} client(s) still on the access point; deferring shutdown");
            return DrainOutcome::Deferred { clients };
        }

        if let Err(err) = platform.stop_access_point() {
            warn!("failed to stop access point: {err}");
        }
        self.ap_active = false;
        self.drain_deadline_ms = None;
        self.state = ProvisioningState::Joined;
        info!("provisioning access point stopped");

        if let Some(record) = record {
            let provisioned = PersistedRecord {
                provisioned: true,
                ..record.clone()
            };
            if let Err(err) = store.save(&provisioned) {
                error!("failed to mark configuration provisioned: {err}");
            }
        }
        DrainOutcome::Completed
    }

    pub fn reset(&mut self) {
        self.state = ProvisioningState::Unprovisioned;
        self.drain_deadline_ms = None;
    }

    fn join<P>(&self, platform: &mut P, credentials: &NetworkCredentials) -> Result<(), JoinError>
    where
        P: WifiRadio + Clock,
    {
        if credentials.ssid.is_empty() {
            return Err(JoinError::MissingCredentials);
        }

        platform.begin_join(credentials)?;
        let joined = self.join_policy.poll_until(
            platform,
            |platform, ms| platform.sleep_ms(ms),
            |platform, _| platform.is_joined(),
        );

        if joined {
            info!("joined network `{}`", credentials.ssid);
            Ok(())
        } else {
            Err(JoinError::Exhausted {
                ssid: credentials.ssid.clone(),
                attempts: self.join_policy.max_attempts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{record::MemoryStorage, test_support::FakePlatform};

    fn manager() -> ProvisioningManager {
        ProvisioningManager::new("Homuino-Provisioning", RetryPolicy::WIFI_JOIN, 30_000)
    }

    fn submission(ssid: &str) -> ProvisioningSubmission {
        ProvisioningSubmission {
            ssid: ssid.to_string(),
            password: String::new(),
            device_id: "dev-1".to_string(),
            user_id: "user-1".to_string(),
            user_email: "owner@example.com".to_string(),
        }
    }

    fn provisioned_record(ssid: &str) -> PersistedRecord {
        PersistedRecord {
            provisioned: true,
            ..submission(ssid).into_record().unwrap()
        }
    }

    #[test]
    fn empty_storage_boots_into_broadcast() {
        let mut platform = FakePlatform::with_network("HomeNet");
        let mut provisioning = manager();

        assert!(!provisioning.boot(&mut platform, None));
        assert_eq!(provisioning.state(), ProvisioningState::ProvisioningBroadcast);
        assert_eq!(platform.access_point.as_deref(), Some("Homuino-Provisioning"));
        assert!(platform.join_requests.is_empty());
    }

    #[test]
    fn provisioned_record_joins_without_broadcast() {
        let mut platform = FakePlatform::with_network("HomeNet");
        let mut provisioning = manager();

        assert!(provisioning.boot(&mut platform, Some(&provisioned_record("HomeNet"))));
        assert_eq!(provisioning.state(), ProvisioningState::Joined);
        assert_eq!(platform.access_point_starts, 0);
    }

    #[test]
    fn unprovisioned_record_broadcasts() {
        let mut platform = FakePlatform::with_network("HomeNet");
        let mut provisioning = manager();
        let record = submission("HomeNet").into_record().unwrap();

        assert!(!provisioning.boot(&mut platform, Some(&record)));
        assert_eq!(provisioning.state(), ProvisioningState::ProvisioningBroadcast);
    }

    #[test]
    fn unreachable_network_falls_back_after_join_ceiling() {
        let mut platform = FakePlatform::default();
        let mut provisioning = manager();

        assert!(!provisioning.boot(&mut platform, Some(&provisioned_record("Gone"))));
        assert_eq!(provisioning.state(), ProvisioningState::ProvisioningBroadcast);
        // 20 checks, 19 pauses of 500 ms.
        assert_eq!(platform.clock.now(), 9_500);
    }

    #[test]
    fn missing_fields_are_rejected_before_joining() {
        let mut platform = FakePlatform::with_network("HomeNet");
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut provisioning = manager();
        provisioning.boot(&mut platform, None);

        let mut incomplete = submission("HomeNet");
        incomplete.user_email = " ".to_string();

        let err = provisioning
            .submit(&mut platform, &mut store, incomplete)
            .unwrap_err();
        assert_eq!(err, SubmissionError::MissingField);
        assert_eq!(err.status_code(), 400);
        assert!(platform.join_requests.is_empty());
    }

    #[test]
    fn failed_join_keeps_broadcasting() {
        let mut platform = FakePlatform::default();
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut provisioning = manager();
        provisioning.boot(&mut platform, None);

        let err = provisioning
            .submit(&mut platform, &mut store, submission("Nowhere"))
            .unwrap_err();

        assert_eq!(err.status_code(), 503);
        assert_eq!(provisioning.state(), ProvisioningState::ProvisioningBroadcast);
        assert_eq!(store.storage().commits, 0);
    }

    #[test]
    fn accepted_submission_persists_unprovisioned_record() {
        let mut platform = FakePlatform::with_network("HomeNet");
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut provisioning = manager();
        provisioning.boot(&mut platform, None);

        let record = provisioning
            .submit(&mut platform, &mut store, submission("HomeNet"))
            .unwrap();

        assert_eq!(provisioning.state(), ProvisioningState::Joined);
        assert!(provisioning.is_access_point_active());
        assert_eq!(store.load(), Some(record));
        assert_eq!(
            provisioning.submit(&mut platform, &mut store, submission("HomeNet")),
            Err(SubmissionError::NotAccepting)
        );
    }

    #[test]
    fn drain_waits_for_associated_clients() {
        let mut platform = FakePlatform::with_network("HomeNet");
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut provisioning = manager();
        provisioning.boot(&mut platform, None);
        let record = provisioning
            .submit(&mut platform, &mut store, submission("HomeNet"))
            .unwrap();

        provisioning.backend_ready(1_000);
        assert_eq!(
            provisioning.state(),
            ProvisioningState::ProvisioningBroadcastDraining
        );
        assert_eq!(
            provisioning.poll_drain(&mut platform, &mut store, Some(&record), 30_999),
            DrainOutcome::Waiting
        );

        platform.clients = 1;
        assert_eq!(
            provisioning.poll_drain(&mut platform, &mut store, Some(&record), 31_000),
            DrainOutcome::Deferred { clients: 1 }
        );
        assert!(platform.access_point.is_some());
        assert!(!store.load().unwrap().provisioned);

        platform.clients = 0;
        assert_eq!(
            provisioning.poll_drain(&mut platform, &mut store, Some(&record), 31_100),
            DrainOutcome::Completed
        );
        assert!(platform.access_point.is_none());
        assert!(store.load().unwrap().provisioned);
        assert_eq!(provisioning.state(), ProvisioningState::Joined);
    }

    #[test]
    fn rejoined_station_leaves_broadcast_and_drains() {
        let mut platform = FakePlatform::default();
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut provisioning = manager();
        let record = provisioned_record("HomeNet");

        assert!(!provisioning.boot(&mut platform, Some(&record)));
        provisioning.backend_ready(0);
        assert_eq!(provisioning.state(), ProvisioningState::ProvisioningBroadcast);

        provisioning.station_rejoined();
        assert_eq!(provisioning.state(), ProvisioningState::Joined);
        provisioning.backend_ready(1_000);
        assert_eq!(
            provisioning.poll_drain(&mut platform, &mut store, Some(&record), 31_000),
            DrainOutcome::Completed
        );
        assert!(platform.access_point.is_none());

        provisioning.station_rejoined();
        assert_eq!(provisioning.state(), ProvisioningState::Joined);
    }
}
