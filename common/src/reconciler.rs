use log::{debug, info, warn};

use crate::{
    backend::RemoteBackend,
    ports::{Actuator, Clock},
    sync::SyncClient,
    types::SwitchState,
};

/// Keeps the physical switch aligned with the remote desired state.
///
/// Values arrive through the stream (push) and a periodic read (poll). Both
/// paths feed [`Reconciler::apply`], so a value seen twice drives the
/// actuator once.
#[derive(Debug, Clone)]
pub struct Reconciler {
    observed: bool,
    pending_mirror: Option<bool>,
    poll_interval_ms: u64,
    last_poll_ms: Option<u64>,
}

impl Reconciler {
    pub fn new(poll_interval_ms: u64) -> Self {
        Self {
            observed: false,
            pending_mirror: None,
            poll_interval_ms,
            last_poll_ms: None,
        }
    }

    pub fn observed(&self) -> bool {
        self.observed
    }

    pub fn has_pending_mirror(&self) -> bool {
        self.pending_mirror.is_some()
    }

    /// Returns `true` when the actuator was driven.
    pub fn apply(&mut self, actuator: &mut impl Actuator, desired: bool) -> bool {
        if desired == self.observed {
            return false;
        }

        info!("switch {}", SwitchState::from(desired).as_str());
        actuator.drive(desired);
        self.observed = desired;
        self.pending_mirror = Some(desired);
        true
    }

    pub fn poll_due(&self, now_ms: u64) -> bool {
        self.last_poll_ms
            .map(|last| now_ms.saturating_sub(last) >= self.poll_interval_ms)
            .unwrap_or(true)
    }

    /// Reads the desired state when the poll interval elapsed.
    pub fn poll<B: RemoteBackend>(
        &mut self,
        now_ms: u64,
        sync: &mut SyncClient<B>,
        actuator: &mut impl Actuator,
        path: &str,
    ) {
        if !self.poll_due(now_ms) {
            return;
        }
        self.last_poll_ms = Some(now_ms);

        match sync.read_bool(path) {
            Ok(desired) => {
                self.apply(actuator, desired);
            }
            Err(err) => debug!("desired state poll failed: {err}"),
        }
    }

    /// Writes the `ON`/`OFF` display value for the last applied change.
    /// A failure is logged and leaves the actuator as it is.
    pub fn flush_mirror<B: RemoteBackend>(
        &mut self,
        sync: &mut SyncClient<B>,
        clock: &impl Clock,
        path: &str,
    ) {
        let Some(on) = self.pending_mirror.take() else {
            return;
        };

        if let Err(err) = sync.write_string(path, SwitchState::from(on).as_str(), clock) {
            warn!("switch state mirror not updated: {err}");
        }
    }
}
