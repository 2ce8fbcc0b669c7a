pub const DEVICES_ROOT: &str = "devices";

pub const KEY_IS_ON: &str = "isOn";
pub const KEY_SWITCH_STATE: &str = "switchState";
pub const KEY_STATUS: &str = "status";
pub const KEY_OWNER_ID: &str = "ownerId";
pub const KEY_USER_EMAIL: &str = "userEmail";
pub const KEY_LAST_SEEN: &str = "lastSeen";
pub const KEY_TIMERS: &str = "timers";
pub const KEY_LOGS: &str = "logs";

pub const TIMER_KEY_PREFIX: &str = "timer_";

/// Backend paths under `devices/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    root: String,
}

impl DevicePaths {
    pub fn new(device_id: &str) -> Self {
        Self {
            root: format!("{DEVICES_ROOT}/{device_id}"),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn child(&self, key: &str) -> String {
        format!("{}/{key}", self.root)
    }

    pub fn is_on(&self) -> String {
        self.child(KEY_IS_ON)
    }

    pub fn switch_state(&self) -> String {
        self.child(KEY_SWITCH_STATE)
    }

    pub fn status(&self) -> String {
        self.child(KEY_STATUS)
    }

    pub fn owner_id(&self) -> String {
        self.child(KEY_OWNER_ID)
    }

    pub fn user_email(&self) -> String {
        self.child(KEY_USER_EMAIL)
    }

    pub fn last_seen(&self) -> String {
        self.child(KEY_LAST_SEEN)
    }

    pub fn timers(&self) -> String {
        self.child(KEY_TIMERS)
    }

    pub fn log_entry(&self, timestamp: u64) -> String {
        format!("{}/{KEY_LOGS}/{timestamp}", self.root)
    }
}
