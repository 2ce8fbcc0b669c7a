use log::{debug, error, info, warn};

use crate::{
    backend::RemoteBackend,
    config::RuntimeConfig,
    error::{AuthError, SubmissionError},
    paths::DevicePaths,
    ports::Platform,
    provisioning::{DrainOutcome, ProvisioningManager, ProvisioningState, ProvisioningSubmission},
    reconciler::Reconciler,
    record::{ConfigStore, PersistedRecord, RecordStorage},
    schedule::ScheduleEvaluator,
    session::ConnectivitySession,
    sync::SyncClient,
    types::{DeviceStatus, LoopControl, StreamEvent},
};

const ARCHIVE_SETTLE_MS: u64 = 500;
const RESTART_SETTLE_MS: u64 = 1_000;
const READY_BLINKS: u8 = 5;
const READY_BLINK_PERIOD_MS: u64 = 200;

/// Single-threaded control loop owning every engine component.
///
/// `boot` runs once, then `tick` is called forever. Provisioning form
/// submissions are handed in between ticks through `handle_submission`.
pub struct Supervisor<P, S, B> {
    config: RuntimeConfig,
    platform: P,
    store: ConfigStore<S>,
    sync: SyncClient<B>,
    provisioning: ProvisioningManager,
    reconciler: Reconciler,
    schedule: ScheduleEvaluator,
    session: ConnectivitySession,
    record: Option<PersistedRecord>,
    paths: Option<DevicePaths>,
    bring_up_pending: bool,
    /// Set once identity, subscription and drain hand-off have all run.
    bring_up_complete: bool,
    auth_rejected: bool,
    last_recovery_ms: Option<u64>,
}

impl<P, S, B> Supervisor<P, S, B>
where
    P: Platform,
    S: RecordStorage,
    B: RemoteBackend,
{
    pub fn new(mut config: RuntimeConfig, platform: P, storage: S, backend: B) -> Self {
        config.sanitize();
        let sync = SyncClient::new(backend, config.retry.backend_ready, config.retry.write);
        let provisioning = ProvisioningManager::new(
            config.provisioning_ap_ssid.clone(),
            config.retry.wifi_join,
            config.timing.ap_drain_grace_ms,
        );
        let reconciler = Reconciler::new(config.timing.poll_interval_ms);
        let schedule = ScheduleEvaluator::new(config.timing.schedule_interval_ms);

        Self {
            config,
            platform,
            store: ConfigStore::new(storage),
            sync,
            provisioning,
            reconciler,
            schedule,
            session: ConnectivitySession::new(),
            record: None,
            paths: None,
            bring_up_pending: false,
            bring_up_complete: false,
            auth_rejected: false,
            last_recovery_ms: None,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn backend(&self) -> &B {
        self.sync.backend()
    }

    pub fn storage(&self) -> &S {
        self.store.storage()
    }

    pub fn session(&self) -> &ConnectivitySession {
        &self.session
    }

    pub fn provisioning_state(&self) -> ProvisioningState {
        self.provisioning.state()
    }

    pub fn observed_state(&self) -> bool {
        self.reconciler.observed()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.record
            .as_ref()
            .map(|record| record.identity.device_id.as_str())
    }

    pub fn boot(&mut self) -> LoopControl {
        info!("homuino starting");
        self.platform.drive(self.reconciler.observed());

        if self.check_factory_reset() == LoopControl::Restart {
            return LoopControl::Restart;
        }

        let record = self.store.load();
        if let Some(record) = record.as_ref().filter(|record| record.provisioned) {
            self.adopt_record(record.clone());
        }

        if self.provisioning.boot(&mut self.platform, record.as_ref()) {
            self.session.is_network_joined = true;
            self.bring_up_backend();
        }
        LoopControl::Continue
    }

    /// Applies a configuration form submission. Backend bring-up runs on the
    /// next tick so the submitter gets its reply first.
    pub fn handle_submission(
        &mut self,
        submission: ProvisioningSubmission,
    ) -> Result<(), SubmissionError> {
        let record = self
            .provisioning
            .submit(&mut self.platform, &mut self.store, submission)?;

        self.adopt_record(record);
        self.session.is_network_joined = true;
        self.bring_up_pending = true;
        Ok(())
    }

    pub fn tick(&mut self) -> LoopControl {
        if self.check_factory_reset() == LoopControl::Restart {
            return LoopControl::Restart;
        }
        if self.bring_up_pending {
            self.bring_up_backend();
        }

        let now = self.platform.now_ms();
        self.poll_drain(now);
        self.recover(now);
        self.check_liveness(now);
        self.drain_stream();
        self.poll_desired_state(now);
        self.flush_mirror();
        self.evaluate_schedule(now);

        self.platform.sleep_ms(self.config.timing.loop_delay_ms);
        LoopControl::Continue
    }

    fn adopt_record(&mut self, record: PersistedRecord) {
        self.paths = Some(DevicePaths::new(&record.identity.device_id));
        self.record = Some(record);
    }

    fn bring_up_backend(&mut self) {
        self.bring_up_pending = false;
        let Some(paths) = self.paths.clone() else {
            warn!("no device identity; backend not started");
            return;
        };

        if self.platform.wall_clock().is_none() {
            self.platform.start_time_sync();
            let synced = self.config.retry.time_sync.poll_until(
                &mut self.platform,
                |platform, ms| platform.sleep_ms(ms),
                |platform, _| platform.wall_clock().is_some(),
            );
            if synced {
                info!("time synchronized");
            } else {
                warn!("time not synchronized; schedules wait for the clock");
            }
        }

        let connected = if self.sync.has_started() {
            self.connect_backend(|sync, platform| sync.reconnect(platform))
        } else {
            self.connect_backend(|sync, platform| sync.connect(platform))
        };
        if connected {
            self.finish_bring_up(&paths);
        }
    }

    /// Announces the device once the backend is ready and hands the access
    /// point over to the drain.
    fn finish_bring_up(&mut self, paths: &DevicePaths) {
        if self.write_identity(paths) {
            self.report_status(DeviceStatus::Online);
        }
        if self.config.reset_desired_state_on_boot {
            if let Err(err) = self.sync.write_bool(&paths.is_on(), false, &self.platform) {
                warn!("failed to reset desired state: {err}");
            }
            if let Err(err) = self.sync.write_string(&paths.switch_state(), "OFF", &self.platform) {
                warn!("failed to reset switch state: {err}");
            }
        }
        self.subscribe(paths);

        self.platform.blink(READY_BLINKS, READY_BLINK_PERIOD_MS);
        self.platform.set_indicator(self.reconciler.observed());

        let now = self.platform.now_ms();
        self.provisioning.backend_ready(now);
        self.bring_up_complete = true;
    }

    /// Runs `attempt` and folds its outcome into the session. Returns `true`
    /// when the backend is ready.
    fn connect_backend(
        &mut self,
        attempt: impl FnOnce(&mut SyncClient<B>, &P) -> Result<(), AuthError>,
    ) -> bool {
        match attempt(&mut self.sync, &self.platform) {
            Ok(()) => {
                self.session.is_backend_ready = true;
                true
            }
            Err(AuthError::Rejected(reason)) => {
                error!("backend rejected device credentials: {reason}");
                self.auth_rejected = true;
                self.session.is_backend_ready = false;
                false
            }
            Err(err) => {
                warn!("{err}; will retry");
                self.session.is_backend_ready = false;
                false
            }
        }
    }

    fn write_identity(&mut self, paths: &DevicePaths) -> bool {
        let Some(identity) = self.record.as_ref().map(|record| record.identity.clone()) else {
            return false;
        };

        let owner = self
            .sync
            .write_string(&paths.owner_id(), &identity.owner_id, &self.platform);
        let email = self
            .sync
            .write_string(&paths.user_email(), &identity.owner_email, &self.platform);

        match owner.and(email) {
            Ok(()) => true,
            Err(err) => {
                self.log_error(&format!("failed to write owner identity: {err}"));
                false
            }
        }
    }

    fn subscribe(&mut self, paths: &DevicePaths) {
        match self.sync.subscribe(&paths.is_on()) {
            Ok(()) => self.session.is_stream_live = true,
            Err(err) => {
                self.session.is_stream_live = false;
                self.log_error(&format!("failed to subscribe to desired state: {err}"));
            }
        }
    }

    fn poll_drain(&mut self, now: u64) {
        let outcome = self.provisioning.poll_drain(
            &mut self.platform,
            &mut self.store,
            self.record.as_ref(),
            now,
        );
        if outcome == DrainOutcome::Completed {
            if let Some(record) = self.record.as_mut() {
                record.provisioned = true;
            }
        }
    }

    fn check_liveness(&mut self, now: u64) {
        let Some(paths) = self.paths.clone() else {
            return;
        };
        if !self.sync.has_started()
            || !self
                .session
                .liveness_due(now, self.config.timing.liveness_interval_ms)
        {
            return;
        }
        self.session.last_liveness_ms = Some(now);

        if !self.sync.is_ready() {
            debug!("backend not ready; liveness write skipped");
            return;
        }

        let stamp = self.timestamp_ms();
        match self.sync.write_int(&paths.last_seen(), stamp, &self.platform) {
            Ok(()) => {
                self.session.is_backend_ready = true;
                self.report_status(DeviceStatus::Online);
            }
            Err(err) if err.is_connection_failure() => {
                warn!("liveness write failed: {err}");
                self.session.is_backend_ready = false;
                self.report_status(DeviceStatus::Offline);
            }
            Err(err) => self.log_error(&format!("liveness write failed: {err}")),
        }
    }

    fn recover(&mut self, now: u64) {
        if self.auth_rejected || self.paths.is_none() {
            return;
        }
        if self.session.is_backend_ready && self.sync.is_ready() {
            return;
        }
        let interval = self.config.timing.reconnect_kick_interval_ms;
        if self
            .last_recovery_ms
            .is_some_and(|last| now.saturating_sub(last) < interval)
        {
            return;
        }
        self.last_recovery_ms = Some(now);

        self.session.is_network_joined = self.platform.is_joined();
        if !self.session.is_network_joined {
            info!("network down; asking station to reconnect");
            self.platform.reconnect();
            return;
        }

        self.provisioning.station_rejoined();
        self.session.reset();
        self.session.is_network_joined = true;
        if !self.bring_up_complete {
            self.bring_up_backend();
            return;
        }

        if self.connect_backend(|sync, platform| sync.reconnect(platform)) {
            info!("backend connection restored");
            self.report_status(DeviceStatus::Online);
            if let Some(paths) = self.paths.clone() {
                self.subscribe(&paths);
            }
        } else {
            self.report_status(DeviceStatus::Offline);
        }
    }

    fn drain_stream(&mut self) {
        while let Some(event) = self.sync.next_event() {
            match event {
                StreamEvent::ValueChanged(desired) => {
                    self.reconciler.apply(&mut self.platform, desired);
                }
                StreamEvent::StreamTimedOut => {
                    warn!("stream timed out; resubscribing");
                    self.session.is_stream_live = false;
                    self.report_status(DeviceStatus::Offline);
                    if let Some(paths) = self.paths.clone() {
                        self.subscribe(&paths);
                    }
                }
            }
        }
    }

    fn poll_desired_state(&mut self, now: u64) {
        let Some(paths) = self.paths.as_ref() else {
            return;
        };
        if !self.session.is_backend_ready {
            return;
        }
        self.reconciler
            .poll(now, &mut self.sync, &mut self.platform, &paths.is_on());
    }

    fn flush_mirror(&mut self) {
        let Some(paths) = self.paths.as_ref() else {
            return;
        };
        self.reconciler
            .flush_mirror(&mut self.sync, &self.platform, &paths.switch_state());
    }

    fn evaluate_schedule(&mut self, now: u64) {
        if !self.schedule.is_due(now) {
            return;
        }
        let Some(paths) = self.paths.clone() else {
            return;
        };
        if !self.session.is_backend_ready {
            return;
        }
        let Some(local) = self.platform.wall_clock() else {
            debug!("clock not synchronized; schedule check skipped");
            return;
        };
        let schedule = match self.sync.read_schedule(&paths.timers()) {
            Ok(schedule) => schedule,
            Err(err) => {
                self.log_error(&format!("failed to read schedule: {err}"));
                return;
            }
        };
        self.schedule.mark_checked(now);
        debug!("checking {} timer(s) at {}", schedule.len(), local.format("%H:%M"));

        let Some(desired) = self
            .schedule
            .evaluate(&schedule, &local, self.reconciler.observed())
        else {
            return;
        };
        match self.sync.write_bool(&paths.is_on(), desired, &self.platform) {
            Ok(()) => self.schedule.mark_fired(&local),
            Err(err) => self.log_error(&format!("scheduled switch write failed: {err}")),
        }
    }

    fn check_factory_reset(&mut self) -> LoopControl {
        if !self.platform.is_held() {
            return LoopControl::Continue;
        }
        info!("reset input held; confirming");
        self.platform.sleep_ms(self.config.timing.reset_hold_ms);
        if !self.platform.is_held() {
            info!("reset input released");
            return LoopControl::Continue;
        }

        self.factory_reset()
    }

    fn factory_reset(&mut self) -> LoopControl {
        warn!("factory reset");
        if self.sync.is_ready() && self.paths.is_some() {
            self.report_status(DeviceStatus::Archived);
        }
        self.platform.sleep_ms(ARCHIVE_SETTLE_MS);

        if let Err(err) = self.store.erase() {
            error!("failed to erase configuration: {err}");
        }
        self.record = None;
        self.paths = None;
        self.bring_up_complete = false;
        self.session.reset();
        self.provisioning.reset();

        self.platform.disconnect();
        self.platform.sleep_ms(RESTART_SETTLE_MS);
        LoopControl::Restart
    }

    fn report_status(&mut self, status: DeviceStatus) {
        let Some(path) = self.paths.as_ref().map(DevicePaths::status) else {
            return;
        };
        if !self.sync.is_ready() {
            warn!("backend not ready; status {} not reported", status.as_str());
            return;
        }

        match self.sync.write_string(&path, status.as_str(), &self.platform) {
            Ok(()) => {
                debug!("status {}", status.as_str());
                self.session.status = Some(status);
            }
            Err(err) => error!("giving up on status {}: {err}", status.as_str()),
        }
    }

    /// Logs locally and appends the line to the device log when possible.
    fn log_error(&mut self, message: &str) {
        error!("{message}");

        let Some(paths) = self.paths.as_ref() else {
            return;
        };
        if !self.sync.is_ready() {
            return;
        }

        let stamp = self.timestamp_ms();
        let local = self
            .platform
            .wall_clock()
            .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| format!("[{}]", self.platform.now_ms()));
        let line = format!("{local} [ERROR] {message}");
        let path = paths.log_entry(stamp);

        if let Err(err) = self.sync.write_string(&path, &line, &self.platform) {
            warn!("device log not written: {err}");
        }
    }

    /// Epoch milliseconds once time is synchronized, uptime before that.
    fn timestamp_ms(&self) -> u64 {
        self.platform
            .wall_clock()
            .and_then(|time| u64::try_from(time.timestamp_millis()).ok())
            .unwrap_or_else(|| self.platform.now_ms())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        backend::AuthState,
        error::SyncError,
        record::{DeviceIdentity, MemoryStorage, NetworkCredentials},
        stream::RawStreamEvent,
        test_support::{local, FakeBackend, FakePlatform},
    };

    type TestSupervisor = Supervisor<FakePlatform, MemoryStorage, FakeBackend>;

    const IS_ON: &str = "devices/dev-1/isOn";
    const STATUS: &str = "devices/dev-1/status";
    const LAST_SEEN: &str = "devices/dev-1/lastSeen";
    const SWITCH_STATE: &str = "devices/dev-1/switchState";
    const TIMERS: &str = "devices/dev-1/timers";

    fn stored(provisioned: bool) -> MemoryStorage {
        let record = PersistedRecord {
            identity: DeviceIdentity {
                device_id: "dev-1".to_string(),
                owner_id: "user-1".to_string(),
                owner_email: "owner@example.com".to_string(),
            },
            credentials: NetworkCredentials {
                ssid: "HomeNet".to_string(),
                passphrase: "hunter22".to_string(),
            },
            provisioned,
        };
        let mut storage = MemoryStorage::default();
        storage.write(&record.encode().unwrap()).unwrap();
        storage
    }

    fn supervisor(storage: MemoryStorage, backend: FakeBackend) -> TestSupervisor {
        Supervisor::new(
            RuntimeConfig::default(),
            FakePlatform::with_network("HomeNet"),
            storage,
            backend,
        )
    }

    fn booted() -> TestSupervisor {
        let mut supervisor = supervisor(stored(true), FakeBackend::ready());
        assert_eq!(supervisor.boot(), LoopControl::Continue);
        supervisor
    }

    fn submission() -> ProvisioningSubmission {
        ProvisioningSubmission {
            ssid: "HomeNet".to_string(),
            password: "hunter22".to_string(),
            device_id: "dev-1".to_string(),
            user_id: "user-1".to_string(),
            user_email: "owner@example.com".to_string(),
        }
    }

    fn status_writes(supervisor: &TestSupervisor) -> Vec<serde_json::Value> {
        supervisor.backend().writes_to(STATUS)
    }

    #[test]
    fn fresh_device_broadcasts_instead_of_joining() {
        let mut supervisor = supervisor(MemoryStorage::default(), FakeBackend::ready());
        supervisor.boot();

        assert_eq!(
            supervisor.provisioning_state(),
            ProvisioningState::ProvisioningBroadcast
        );
        assert!(supervisor.platform().join_requests.is_empty());
        assert_eq!(supervisor.backend().begin_calls, 0);
    }

    #[test]
    fn provisioned_device_joins_connects_and_subscribes() {
        let supervisor = booted();

        assert_eq!(supervisor.provisioning_state(), ProvisioningState::Joined);
        assert_eq!(supervisor.platform().access_point_starts, 0);
        assert!(supervisor.session().is_network_joined);
        assert!(supervisor.session().is_backend_ready);
        assert!(supervisor.session().is_stream_live);
        assert_eq!(supervisor.backend().streams, vec![IS_ON.to_string()]);
        assert_eq!(status_writes(&supervisor), vec![json!("ONLINE")]);
        assert_eq!(supervisor.backend().writes_to(IS_ON), vec![json!(false)]);
        assert_eq!(supervisor.platform().blinks, vec![(5, 200)]);
    }

    #[test]
    fn rejected_credentials_stop_recovery() {
        let mut supervisor = supervisor(
            stored(true),
            FakeBackend::with_auth(AuthState::Rejected("INVALID_PASSWORD".to_string())),
        );
        supervisor.boot();
        for _ in 0..5 {
            supervisor.tick();
        }

        assert!(!supervisor.session().is_backend_ready);
        assert_eq!(supervisor.backend().begin_calls, 1);
    }

    #[test]
    fn stream_change_drives_actuator_and_mirrors() {
        let mut supervisor = booted();
        supervisor.sync.backend_mut().push_event(RawStreamEvent::Put {
            path: "/".to_string(),
            data: json!(true),
        });
        supervisor.sync.backend_mut().set_value(IS_ON, json!(true));

        supervisor.tick();
        supervisor.tick();

        assert!(supervisor.observed_state());
        assert_eq!(supervisor.platform().drives, vec![false, true]);
        assert_eq!(
            supervisor.backend().writes_to(SWITCH_STATE),
            vec![json!("OFF"), json!("ON")]
        );
    }

    #[test]
    fn observed_state_only_follows_remote_values() {
        let mut supervisor = booted();
        for _ in 0..20 {
            supervisor.tick();
        }
        assert!(!supervisor.observed_state());

        supervisor.sync.backend_mut().set_value(IS_ON, json!(true));
        for _ in 0..10 {
            supervisor.tick();
        }
        assert!(supervisor.observed_state());
    }

    #[test]
    fn stream_timeout_reports_offline_and_resubscribes() {
        let mut supervisor = booted();
        supervisor.sync.backend_mut().push_event(RawStreamEvent::Closed {
            reason: "cancel".to_string(),
        });

        supervisor.tick();

        assert_eq!(supervisor.backend().streams.len(), 2);
        assert!(supervisor.session().is_stream_live);
        assert!(status_writes(&supervisor).contains(&json!("OFFLINE")));
    }

    #[test]
    fn liveness_failures_flip_offline_then_recover() {
        let mut supervisor = booted();
        supervisor.tick();
        assert_eq!(supervisor.backend().write_attempts(LAST_SEEN), 1);

        supervisor
            .sync
            .backend_mut()
            .fail_writes(LAST_SEEN, SyncError::ConnectionRefused, 3);
        supervisor.platform.clock.advance(30_000);
        supervisor.tick();

        assert_eq!(supervisor.backend().write_attempts(LAST_SEEN), 4);
        assert_eq!(supervisor.session().status, Some(DeviceStatus::Offline));
        assert_eq!(status_writes(&supervisor).last(), Some(&json!("OFFLINE")));

        supervisor.platform.clock.advance(30_000);
        supervisor.tick();

        assert!(supervisor.session().is_backend_ready);
        assert_eq!(supervisor.session().status, Some(DeviceStatus::Online));
        assert_eq!(status_writes(&supervisor).last(), Some(&json!("ONLINE")));
    }

    #[test]
    fn schedule_fires_once_for_matching_minute() {
        let mut supervisor = booted();
        supervisor.platform.clock.set_wall_clock(local(7, 0));
        supervisor.sync.backend_mut().set_value(
            TIMERS,
            json!({"timer_1": {"time": "07:00", "action": "turn_on", "enabled": true}}),
        );
        let before = supervisor.backend().writes_to(IS_ON).len();

        supervisor.tick();
        assert_eq!(
            supervisor.backend().writes_to(IS_ON)[before..],
            [json!(true)]
        );

        // The write reaches the actuator through the poll path.
        supervisor.platform.clock.advance(500);
        supervisor.tick();
        assert!(supervisor.observed_state());
        supervisor.schedule = ScheduleEvaluator::new(60_000);
        supervisor.tick();
        assert_eq!(supervisor.backend().writes_to(IS_ON).len(), before + 1);
    }

    #[test]
    fn submission_brings_up_backend_and_drains_access_point() {
        let mut supervisor = supervisor(MemoryStorage::default(), FakeBackend::ready());
        supervisor.boot();

        assert_eq!(supervisor.handle_submission(submission()), Ok(()));
        assert!(!supervisor.storage().region.iter().all(|byte| *byte == 0));
        supervisor.tick();
        assert_eq!(
            supervisor.provisioning_state(),
            ProvisioningState::ProvisioningBroadcastDraining
        );
        assert_eq!(
            supervisor.backend().writes_to("devices/dev-1/ownerId"),
            vec![json!("user-1")]
        );

        supervisor.platform.clients = 1;
        supervisor.platform.clock.advance(30_000);
        supervisor.tick();
        assert!(supervisor.platform().access_point.is_some());

        supervisor.platform.clients = 0;
        supervisor.tick();
        assert!(supervisor.platform().access_point.is_none());

        let mut store = ConfigStore::new(supervisor.storage().clone());
        assert!(store.load().unwrap().provisioned);
    }

    #[test]
    fn submission_outside_broadcast_is_refused() {
        let mut supervisor = booted();

        assert_eq!(
            supervisor.handle_submission(submission()),
            Err(SubmissionError::NotAccepting)
        );
    }

    #[test]
    fn held_reset_input_archives_erases_and_restarts() {
        let mut supervisor = booted();
        supervisor.platform.reset_held = true;

        assert_eq!(supervisor.tick(), LoopControl::Restart);
        assert_eq!(status_writes(&supervisor).last(), Some(&json!("ARCHIVED")));
        assert!(supervisor.storage().region.iter().all(|byte| *byte == 0));
        assert_eq!(supervisor.device_id(), None);
        assert_eq!(supervisor.platform().disconnects, 1);
    }

    #[test]
    fn network_loss_kicks_station_reconnect() {
        let mut supervisor = booted();
        supervisor.sync.backend_mut().auth = AuthState::Pending;
        supervisor.session.is_backend_ready = false;
        supervisor.platform.joined = false;
        supervisor.platform.reachable.clear();

        supervisor.tick();
        supervisor.tick();
        assert_eq!(supervisor.platform().reconnect_calls, 1);

        supervisor.platform.clock.advance(30_000);
        supervisor.tick();
        assert_eq!(supervisor.platform().reconnect_calls, 2);
    }

    #[test]
    fn late_backend_readiness_still_completes_provisioning() {
        let mut supervisor = supervisor(
            MemoryStorage::default(),
            FakeBackend::with_auth(AuthState::Pending),
        );
        supervisor.boot();
        assert_eq!(supervisor.handle_submission(submission()), Ok(()));

        supervisor.tick();
        assert!(!supervisor.session().is_backend_ready);
        assert_eq!(supervisor.provisioning_state(), ProvisioningState::Joined);

        supervisor.sync.backend_mut().auth_on_begin = Some(AuthState::Ready);
        supervisor.platform.clock.advance(30_000);
        supervisor.tick();
        assert!(supervisor.session().is_backend_ready);
        assert_eq!(
            supervisor.provisioning_state(),
            ProvisioningState::ProvisioningBroadcastDraining
        );
        assert_eq!(
            supervisor.backend().writes_to("devices/dev-1/ownerId"),
            vec![json!("user-1")]
        );
        assert_eq!(supervisor.backend().streams, vec![IS_ON.to_string()]);

        supervisor.platform.clock.advance(30_000);
        supervisor.tick();
        assert_eq!(supervisor.provisioning_state(), ProvisioningState::Joined);
        assert!(supervisor.platform().access_point.is_none());
        let mut store = ConfigStore::new(supervisor.storage().clone());
        assert!(store.load().unwrap().provisioned);
    }

    #[test]
    fn broadcast_fallback_drains_once_station_rejoins() {
        let mut supervisor = Supervisor::new(
            RuntimeConfig::default(),
            FakePlatform::default(),
            stored(true),
            FakeBackend::ready(),
        );
        assert_eq!(supervisor.boot(), LoopControl::Continue);
        assert_eq!(
            supervisor.provisioning_state(),
            ProvisioningState::ProvisioningBroadcast
        );
        assert_eq!(supervisor.backend().begin_calls, 0);

        supervisor.platform.reachable.push("HomeNet".to_string());
        supervisor.tick();
        assert!(supervisor.platform().joined);

        supervisor.platform.clock.advance(30_000);
        supervisor.tick();
        assert!(supervisor.session().is_backend_ready);
        assert_eq!(
            supervisor.provisioning_state(),
            ProvisioningState::ProvisioningBroadcastDraining
        );

        supervisor.platform.clock.advance(30_000);
        supervisor.tick();
        assert_eq!(supervisor.provisioning_state(), ProvisioningState::Joined);
        assert!(supervisor.platform().access_point.is_none());
        let mut store = ConfigStore::new(supervisor.storage().clone());
        assert!(store.load().unwrap().provisioned);
    }

    #[test]
    fn failed_schedule_read_is_logged_and_retried_within_the_minute() {
        let mut supervisor = booted();
        supervisor.platform.clock.set_wall_clock(local(7, 0));
        supervisor.sync.backend_mut().set_value(
            TIMERS,
            json!({"timer_1": {"time": "07:00", "action": "turn_on", "enabled": true}}),
        );
        let before = supervisor.backend().writes_to(IS_ON).len();

        supervisor.sync.backend_mut().read_failure = Some(SyncError::Timeout);
        supervisor.tick();
        assert_eq!(supervisor.backend().writes_to(IS_ON).len(), before);
        let logged = supervisor.backend().writes.iter().any(|(path, line)| {
            path.starts_with("devices/dev-1/logs/")
                && line
                    .as_str()
                    .is_some_and(|line| line.contains("failed to read schedule"))
        });
        assert!(logged);

        supervisor.sync.backend_mut().read_failure = None;
        supervisor.platform.clock.advance(500);
        supervisor.tick();
        assert_eq!(
            supervisor.backend().writes_to(IS_ON)[before..],
            [json!(true)]
        );
    }

    #[test]
    fn reset_held_at_boot_erases_before_loading() {
        let mut supervisor = supervisor(stored(true), FakeBackend::ready());
        supervisor.platform.reset_held = true;

        assert_eq!(supervisor.boot(), LoopControl::Restart);
        assert!(supervisor.storage().region.iter().all(|byte| *byte == 0));
        assert_eq!(supervisor.device_id(), None);
        assert!(supervisor.platform().join_requests.is_empty());
        assert_eq!(supervisor.backend().begin_calls, 0);
        assert!(status_writes(&supervisor).is_empty());
    }

    #[test]
    fn reset_released_before_confirmation_keeps_configuration() {
        let mut supervisor = booted();
        let pressed_at = supervisor.platform().clock.now();
        supervisor.platform.reset_held = true;
        supervisor.platform.reset_released_at_ms = Some(pressed_at + 2_000);

        assert_eq!(supervisor.tick(), LoopControl::Continue);
        assert!(supervisor.platform().clock.now() >= pressed_at + 5_000);
        assert_eq!(supervisor.device_id(), Some("dev-1"));
        assert!(!supervisor.storage().region.iter().all(|byte| *byte == 0));
        assert_eq!(supervisor.platform().disconnects, 0);
        assert!(!status_writes(&supervisor).contains(&json!("ARCHIVED")));
    }
}
