use log::{debug, info, warn};
use serde_json::Value;

use crate::{
    backend::{AuthState, RemoteBackend},
    error::{AuthError, SyncError},
    ports::Clock,
    retry::{RetryError, RetryPolicy},
    schedule::ScheduleMap,
    stream::RawStreamEvent,
    types::StreamEvent,
};

/// Engine-facing adapter over a [`RemoteBackend`]: bounded waits for
/// readiness, retried writes and typed stream events.
pub struct SyncClient<B> {
    backend: B,
    ready_policy: RetryPolicy,
    write_policy: RetryPolicy,
    started: bool,
}

impl<B: RemoteBackend> SyncClient<B> {
    pub fn new(backend: B, ready_policy: RetryPolicy, write_policy: RetryPolicy) -> Self {
        Self {
            backend,
            ready_policy,
            write_policy,
            started: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Whether authentication was ever started during this boot cycle.
    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn is_ready(&mut self) -> bool {
        self.backend.auth_state() == AuthState::Ready
    }

    /// Starts authentication once and waits for readiness. Calling it again
    /// while ready returns immediately.
    pub fn connect(&mut self, clock: &impl Clock) -> Result<(), AuthError> {
        if self.started && self.is_ready() {
            return Ok(());
        }
        if !self.started {
            info!("starting backend session");
            self.backend.begin();
            self.started = true;
        }
        self.wait_ready(clock)
    }

    /// Restarts authentication on an existing session and waits for readiness.
    pub fn reconnect(&mut self, clock: &impl Clock) -> Result<(), AuthError> {
        info!("reconnecting backend session");
        self.backend.begin();
        self.started = true;
        self.wait_ready(clock)
    }

    fn wait_ready(&mut self, clock: &impl Clock) -> Result<(), AuthError> {
        let result = self.ready_policy.run(
            &mut self.backend,
            |_, ms| clock.sleep_ms(ms),
            |backend, attempt| match backend.auth_state() {
                AuthState::Ready => Ok(()),
                AuthState::Pending => {
                    debug!("waiting for backend (attempt {attempt})");
                    Err(None)
                }
                AuthState::Rejected(reason) => Err(Some(reason)),
            },
            Option::is_none,
        );

        match result {
            Ok(()) => {
                info!("backend ready");
                Ok(())
            }
            Err(RetryError {
                last: Some(reason), ..
            }) => Err(AuthError::Rejected(reason)),
            Err(RetryError { attempts, .. }) => Err(AuthError::NotReady { attempts }),
        }
    }

    pub fn read_bool(&mut self, path: &str) -> Result<bool, SyncError> {
        let value = self.backend.get(path)?;
        value.as_bool().ok_or_else(|| SyncError::Decode {
            path: path.to_string(),
            reason: format!("expected a boolean, got {value}"),
        })
    }

    /// A missing timers node is an empty schedule.
    pub fn read_schedule(&mut self, path: &str) -> Result<ScheduleMap, SyncError> {
        match self.backend.get(path)? {
            Value::Null => Ok(ScheduleMap::default()),
            value @ Value::Object(_) => Ok(ScheduleMap::from_value(&value)),
            other => Err(SyncError::Decode {
                path: path.to_string(),
                reason: format!("expected an object, got {other}"),
            }),
        }
    }

    pub fn write_bool(&mut self, path: &str, value: bool, clock: &impl Clock) -> Result<(), SyncError> {
        self.write(path, &Value::Bool(value), clock)
    }

    pub fn write_string(&mut self, path: &str, value: &str, clock: &impl Clock) -> Result<(), SyncError> {
        self.write(path, &Value::String(value.to_string()), clock)
    }

    pub fn write_int(&mut self, path: &str, value: u64, clock: &impl Clock) -> Result<(), SyncError> {
        self.write(path, &Value::from(value), clock)
    }

    /// Retries on its own; callers must not add another retry layer.
    fn write(&mut self, path: &str, value: &Value, clock: &impl Clock) -> Result<(), SyncError> {
        self.write_policy
            .run(
                &mut self.backend,
                |_, ms| clock.sleep_ms(ms),
                |backend, attempt| {
                    backend.set(path, value).inspect_err(|err| {
                        debug!("write to `{path}` failed (attempt {attempt}): {err}");
                    })
                },
                SyncError::is_transient,
            )
            .map_err(|RetryError { attempts, last }| {
                warn!("write to `{path}` failed after {attempts} attempts: {last}");
                last
            })
    }

    pub fn subscribe(&mut self, path: &str) -> Result<(), SyncError> {
        self.backend.open_stream(path)?;
        info!("subscribed to `{path}`");
        Ok(())
    }

    /// Next typed event from the live stream. Never blocks.
    pub fn next_event(&mut self) -> Option<StreamEvent> {
        while let Some(raw) = self.backend.poll_stream() {
            match raw {
                RawStreamEvent::Put { path, data } if path == "/" => match data.as_bool() {
                    Some(value) => return Some(StreamEvent::ValueChanged(value)),
                    None => warn!("ignoring non-boolean stream payload: {data}"),
                },
                RawStreamEvent::Put { path, .. } | RawStreamEvent::Patch { path, .. } => {
                    debug!("ignoring stream change below root at `{path}`");
                }
                RawStreamEvent::KeepAlive => {}
                RawStreamEvent::Closed { reason } => {
                    warn!("stream closed: {reason}");
                    return Some(StreamEvent::StreamTimedOut);
                }
            }
        }
        None
    }
}
