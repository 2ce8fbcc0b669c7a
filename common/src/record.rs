use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Layout version 1 of the persisted record.
pub const RECORD_MAGIC: u32 = 0xABCD_1234;
/// Reserved storage region; the record occupies its head.
pub const RECORD_REGION_SIZE: usize = 512;

const MAGIC_LEN: usize = 4;
const SSID_LEN: usize = 32;
const PASSPHRASE_LEN: usize = 64;
const DEVICE_ID_LEN: usize = 32;
const OWNER_ID_LEN: usize = 32;
const OWNER_EMAIL_LEN: usize = 64;
const FLAG_LEN: usize = 1;

pub const RECORD_LEN: usize = MAGIC_LEN
    + SSID_LEN
    + PASSPHRASE_LEN
    + DEVICE_ID_LEN
    + OWNER_ID_LEN
    + OWNER_EMAIL_LEN
    + FLAG_LEN;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub owner_id: String,
    pub owner_email: String,
}

impl DeviceIdentity {
    pub fn is_empty(&self) -> bool {
        self.device_id.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub ssid: String,
    /// Empty for open networks.
    pub passphrase: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedRecord {
    pub identity: DeviceIdentity,
    pub credentials: NetworkCredentials,
    pub provisioned: bool,
}

impl PersistedRecord {
    pub fn encode(&self) -> Result<[u8; RECORD_LEN], ConfigError> {
        let mut out = [0_u8; RECORD_LEN];
        out[..MAGIC_LEN].copy_from_slice(&RECORD_MAGIC.to_le_bytes());

        let mut offset = MAGIC_LEN;
        for (field, value, len) in [
            ("ssid", &self.credentials.ssid, SSID_LEN),
            ("password", &self.credentials.passphrase, PASSPHRASE_LEN),
            ("deviceId", &self.identity.device_id, DEVICE_ID_LEN),
            ("userId", &self.identity.owner_id, OWNER_ID_LEN),
            ("userEmail", &self.identity.owner_email, OWNER_EMAIL_LEN),
        ] {
            write_field(&mut out[offset..offset + len], field, value)?;
            offset += len;
        }
        out[offset] = u8::from(self.provisioned);

        Ok(out)
    }

    /// Any mismatch of the magic marker means "no record", whatever the other bytes hold.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() < RECORD_LEN {
            return Err(ConfigError::Truncated { len: bytes.len() });
        }

        let mut magic = [0_u8; MAGIC_LEN];
        magic.copy_from_slice(&bytes[..MAGIC_LEN]);
        let found = u32::from_le_bytes(magic);
        if found != RECORD_MAGIC {
            return Err(ConfigError::BadMagic { found });
        }

        let mut cursor = FieldCursor {
            bytes,
            offset: MAGIC_LEN,
        };
        let ssid = cursor.next("ssid", SSID_LEN)?;
        let passphrase = cursor.next("password", PASSPHRASE_LEN)?;
        let device_id = cursor.next("deviceId", DEVICE_ID_LEN)?;
        let owner_id = cursor.next("userId", OWNER_ID_LEN)?;
        let owner_email = cursor.next("userEmail", OWNER_EMAIL_LEN)?;
        let provisioned = bytes[cursor.offset] != 0;

        Ok(Self {
            identity: DeviceIdentity {
                device_id,
                owner_id,
                owner_email,
            },
            credentials: NetworkCredentials { ssid, passphrase },
            provisioned,
        })
    }

    /// Checks every field fits its slot, without producing the bytes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.encode().map(|_| ())
    }
}

fn write_field(slot: &mut [u8], field: &'static str, value: &str) -> Result<(), ConfigError> {
    let raw = value.as_bytes();
    // One byte is always left for the terminator.
    if raw.len() >= slot.len() || raw.contains(&0) {
        return Err(ConfigError::FieldTooLong {
            field,
            max: slot.len() - 1,
        });
    }
    slot[..raw.len()].copy_from_slice(raw);
    Ok(())
}

struct FieldCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl FieldCursor<'_> {
    fn next(&mut self, field: &'static str, len: usize) -> Result<String, ConfigError> {
        let slot = &self.bytes[self.offset..self.offset + len];
        self.offset += len;

        let end = slot.iter().position(|byte| *byte == 0).unwrap_or(len);
        String::from_utf8(slot[..end].to_vec()).map_err(|_| ConfigError::InvalidUtf8 { field })
    }
}

/// Raw access to the reserved persistent region.
pub trait RecordStorage {
    fn read(&mut self, buf: &mut [u8; RECORD_REGION_SIZE]) -> Result<(), ConfigError>;

    /// Writes `bytes` at the start of the region and commits.
    fn write(&mut self, bytes: &[u8]) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone)]
pub struct MemoryStorage {
    pub region: [u8; RECORD_REGION_SIZE],
    pub commits: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            region: [0; RECORD_REGION_SIZE],
            commits: 0,
        }
    }
}

impl RecordStorage for MemoryStorage {
    fn read(&mut self, buf: &mut [u8; RECORD_REGION_SIZE]) -> Result<(), ConfigError> {
        buf.copy_from_slice(&self.region);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ConfigError> {
        if bytes.len() > RECORD_REGION_SIZE {
            return Err(ConfigError::Storage(format!(
                "{} bytes exceed the {RECORD_REGION_SIZE}-byte region",
                bytes.len()
            )));
        }
        self.region[..bytes.len()].copy_from_slice(bytes);
        self.commits += 1;
        Ok(())
    }
}

pub struct ConfigStore<S> {
    storage: S,
}

impl<S: RecordStorage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Reads the record once; every failure is treated as absence.
    pub fn load(&mut self) -> Option<PersistedRecord> {
        let mut region = [0_u8; RECORD_REGION_SIZE];
        if let Err(err) = self.storage.read(&mut region) {
            warn!("failed to read stored configuration: {err}");
            return None;
        }

        match PersistedRecord::decode(&region) {
            Ok(record) => {
                info!("loaded stored configuration");
                log::debug!(
                    "device id: {}, provisioned: {}",
                    record.identity.device_id,
                    record.provisioned
                );
                Some(record)
            }
            Err(err) => {
                warn!("no valid configuration found ({err})");
                None
            }
        }
    }

    pub fn save(&mut self, record: &PersistedRecord) -> Result<(), ConfigError> {
        let bytes = record.encode()?;
        self.storage.write(&bytes)?;
        info!("configuration saved");
        Ok(())
    }

    pub fn erase(&mut self) -> Result<(), ConfigError> {
        self.storage.write(&[0_u8; RECORD_REGION_SIZE])?;
        info!("stored configuration erased");
        Ok(())
    }
}
