//! Deterministic fakes for the platform ports and the remote backend.

use std::{
    cell::Cell,
    collections::{BTreeMap, HashMap, VecDeque},
};

use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use serde_json::Value;

use crate::{
    backend::{AuthState, RemoteBackend},
    error::{JoinError, SyncError},
    ports::{Actuator, Clock, ResetInput, WifiRadio},
    record::NetworkCredentials,
    stream::RawStreamEvent,
};

/// Uptime advances only through `sleep_ms` or [`FakeClock::advance`].
#[derive(Debug)]
pub struct FakeClock {
    now: Cell<u64>,
    wall_base: DateTime<FixedOffset>,
    pub sync_available: bool,
    synced: bool,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self {
            now: Cell::new(0),
            wall_base: local(6, 55),
            sync_available: true,
            synced: false,
        }
    }
}

impl FakeClock {
    pub fn now(&self) -> u64 {
        self.now.get()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    /// Makes `wall_clock` return `at` for the current uptime.
    pub fn set_wall_clock(&mut self, at: DateTime<FixedOffset>) {
        self.wall_base = at - Duration::milliseconds(self.now() as i64);
        self.synced = true;
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }

    fn wall_clock(&self) -> Option<DateTime<FixedOffset>> {
        self.synced
            .then(|| self.wall_base + Duration::milliseconds(self.now() as i64))
    }

    fn start_time_sync(&mut self) {
        if self.sync_available {
            self.synced = true;
        }
    }
}

/// Local time (UTC+8) on the fixture date.
pub fn local(hour: u32, minute: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(8 * 3600)
        .and_then(|offset| offset.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).single())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct FakePlatform {
    pub clock: FakeClock,
    /// SSIDs that can be joined.
    pub reachable: Vec<String>,
    pub joined: bool,
    pub join_requests: Vec<String>,
    pub reconnect_calls: u32,
    pub disconnects: u32,
    pub access_point: Option<String>,
    pub access_point_starts: u32,
    pub clients: usize,
    pub drives: Vec<bool>,
    pub indicator: bool,
    pub blinks: Vec<(u8, u64)>,
    pub reset_held: bool,
    /// Uptime at which a held reset input lets go.
    pub reset_released_at_ms: Option<u64>,
}

impl FakePlatform {
    pub fn with_network(ssid: &str) -> Self {
        Self {
            reachable: vec![ssid.to_string()],
            ..Self::default()
        }
    }
}

impl Clock for FakePlatform {
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        self.clock.sleep_ms(ms);
    }

    fn wall_clock(&self) -> Option<DateTime<FixedOffset>> {
        self.clock.wall_clock()
    }

    fn start_time_sync(&mut self) {
        self.clock.start_time_sync();
    }
}

impl WifiRadio for FakePlatform {
    fn begin_join(&mut self, credentials: &NetworkCredentials) -> Result<(), JoinError> {
        self.join_requests.push(credentials.ssid.clone());
        self.joined = self.reachable.contains(&credentials.ssid);
        Ok(())
    }

    fn is_joined(&mut self) -> bool {
        self.joined
    }

    fn reconnect(&mut self) {
        self.reconnect_calls += 1;
        if let Some(last) = self.join_requests.last() {
            self.joined = self.reachable.contains(last);
        }
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.joined = false;
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), JoinError> {
        self.access_point = Some(ssid.to_string());
        self.access_point_starts += 1;
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), JoinError> {
        self.access_point = None;
        self.clients = 0;
        Ok(())
    }

    fn associated_clients(&mut self) -> usize {
        self.clients
    }
}

impl Actuator for FakePlatform {
    fn drive(&mut self, on: bool) {
        self.drives.push(on);
        self.indicator = on;
    }

    fn set_indicator(&mut self, lit: bool) {
        self.indicator = lit;
    }

    fn blink(&mut self, times: u8, period_ms: u64) {
        self.blinks.push((times, period_ms));
        self.clock.advance(u64::from(times) * period_ms * 2);
    }
}

impl ResetInput for FakePlatform {
    fn is_held(&mut self) -> bool {
        self.reset_held
            && self
                .reset_released_at_ms
                .map_or(true, |released| self.clock.now() < released)
    }
}

#[derive(Debug)]
pub struct FakeBackend {
    pub auth: AuthState,
    /// Replaces `auth` on the next `begin`.
    pub auth_on_begin: Option<AuthState>,
    pub begin_calls: u32,
    pub values: BTreeMap<String, Value>,
    /// Successful writes in order.
    pub writes: Vec<(String, Value)>,
    pub streams: Vec<String>,
    pub read_failure: Option<SyncError>,
    attempts: HashMap<String, u32>,
    write_failures: HashMap<String, VecDeque<SyncError>>,
    events: VecDeque<RawStreamEvent>,
}

impl FakeBackend {
    pub fn with_auth(auth: AuthState) -> Self {
        Self {
            auth,
            auth_on_begin: None,
            begin_calls: 0,
            values: BTreeMap::new(),
            writes: Vec::new(),
            streams: Vec::new(),
            read_failure: None,
            attempts: HashMap::new(),
            write_failures: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn ready() -> Self {
        Self::with_auth(AuthState::Ready)
    }

    /// The next `count` writes to `path` fail with `err`.
    pub fn fail_writes(&mut self, path: &str, err: SyncError, count: usize) {
        self.write_failures
            .entry(path.to_string())
            .or_default()
            .extend(std::iter::repeat(err).take(count));
    }

    pub fn write_attempts(&self, path: &str) -> u32 {
        self.attempts.get(path).copied().unwrap_or(0)
    }

    pub fn writes_to(&self, path: &str) -> Vec<Value> {
        self.writes
            .iter()
            .filter(|(written, _)| written == path)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn push_event(&mut self, event: RawStreamEvent) {
        self.events.push_back(event);
    }

    pub fn set_value(&mut self, path: &str, value: Value) {
        self.values.insert(path.to_string(), value);
    }
}

impl RemoteBackend for FakeBackend {
    fn begin(&mut self) {
        self.begin_calls += 1;
        if let Some(next) = self.auth_on_begin.take() {
            self.auth = next;
        }
    }

    fn auth_state(&mut self) -> AuthState {
        self.auth.clone()
    }

    fn get(&mut self, path: &str) -> Result<Value, SyncError> {
        if let Some(err) = self.read_failure.clone() {
            return Err(err);
        }
        if self.auth != AuthState::Ready {
            return Err(SyncError::NotReady);
        }
        Ok(self.values.get(path).cloned().unwrap_or(Value::Null))
    }

    fn set(&mut self, path: &str, value: &Value) -> Result<(), SyncError> {
        *self.attempts.entry(path.to_string()).or_default() += 1;
        if let Some(err) = self
            .write_failures
            .get_mut(path)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if self.auth != AuthState::Ready {
            return Err(SyncError::NotReady);
        }
        self.values.insert(path.to_string(), value.clone());
        self.writes.push((path.to_string(), value.clone()));
        Ok(())
    }

    fn open_stream(&mut self, path: &str) -> Result<(), SyncError> {
        if self.auth != AuthState::Ready {
            return Err(SyncError::NotReady);
        }
        self.streams.push(path.to_string());
        Ok(())
    }

    fn poll_stream(&mut self) -> Option<RawStreamEvent> {
        self.events.pop_front()
    }
}
