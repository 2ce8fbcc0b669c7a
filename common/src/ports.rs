use chrono::{DateTime, FixedOffset};

use crate::{error::JoinError, record::NetworkCredentials};

pub trait Clock {
    /// Milliseconds since boot.
    fn now_ms(&self) -> u64;

    /// Blocks the whole control loop.
    fn sleep_ms(&self, ms: u64);

    /// Local wall-clock time, `None` until time has been synchronized.
    fn wall_clock(&self) -> Option<DateTime<FixedOffset>>;

    fn start_time_sync(&mut self);
}

pub trait WifiRadio {
    /// Starts joining `credentials`; completion is observed through [`WifiRadio::is_joined`].
    fn begin_join(&mut self, credentials: &NetworkCredentials) -> Result<(), JoinError>;

    fn is_joined(&mut self) -> bool;

    /// Non-blocking nudge for the station to rejoin its last network.
    fn reconnect(&mut self);

    fn disconnect(&mut self);

    fn start_access_point(&mut self, ssid: &str) -> Result<(), JoinError>;

    fn stop_access_point(&mut self) -> Result<(), JoinError>;

    fn associated_clients(&mut self) -> usize;
}

/// Servo plus LED. The LED mirrors the switch position.
pub trait Actuator {
    fn drive(&mut self, on: bool);

    /// Drives the LED alone, without touching the servo.
    fn set_indicator(&mut self, lit: bool);

    fn blink(&mut self, times: u8, period_ms: u64);
}

pub trait ResetInput {
    fn is_held(&mut self) -> bool;
}

pub trait Platform: Clock + WifiRadio + Actuator + ResetInput {}

impl<T> Platform for T where T: Clock + WifiRadio + Actuator + ResetInput {}
