// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Handling of the piCtory hardware configuration document.
//!
//! The document is opaque JSON to the daemon. Only three things are ever
//! extracted: the presence of the required top-level members, the byte
//! address of the status LED register (fed to the soft watchdog), and the
//! module ids (validated against the module catalog before persisting a
//! new document). Everything else is bytes plus a 16 byte digest that is
//! published to PLC server clients.

use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

/// 16 byte MD5 digest of a document.
pub type Digest = [u8; 16];

/// Published while the hardware configuration has not been hashed yet.
pub const DIGEST_UNKNOWN: Digest = [0xFF; 16];
/// Published while the IO overlay document is absent.
pub const DIGEST_ABSENT: Digest = [0x00; 16];

/// Top-level members every hardware configuration document must carry.
const REQUIRED_KEYS: [&str; 3] = ["Devices", "Summary", "App"];

pub fn digest_bytes(bytes: &[u8]) -> Digest {
    md5::compute(bytes).0
}

/// Check the document parses as JSON and carries the required members.
pub fn validate_document(bytes: &[u8]) -> Result<(), DocumentError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| DocumentError::NotJson)?;
    let obj = value.as_object().ok_or(DocumentError::NotJson)?;
    for key in REQUIRED_KEYS {
        if !obj.contains_key(key) {
            return Err(DocumentError::MissingKey(key));
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum DocumentError {
    NotJson,
    MissingKey(&'static str),
}

/// Find the byte address of the status LED register, or -1.
///
/// The address lives in the `BASE` device: its image offset plus the
/// output position of the LED register. Flat devices (product type 135)
/// carry two LED bytes; the watchdog bit is in the second one.
pub fn status_led_address(bytes: &[u8]) -> i32 {
    let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
        return -1;
    };
    let Some(devices) = value.get("Devices").and_then(Value::as_array) else {
        return -1;
    };

    for device in devices {
        if device.get("type").and_then(Value::as_str) != Some("BASE") {
            continue;
        }
        let offset = device.get("offset").and_then(Value::as_i64);
        let led = device
            .get("out")
            .and_then(|out| out.get("0"))
            .and_then(|entry| entry.get(3))
            .and_then(value_as_i64);
        let (Some(offset), Some(led)) = (offset, led) else {
            return -1;
        };
        let mut address = offset + led;
        if device.get("productType").map(json_text).as_deref() == Some("135") {
            address += 1;
        }
        return i32::try_from(address).unwrap_or(-1);
    }
    -1
}

/// Extract the catalog lookup substring of every device id.
///
/// Device ids have the form `device_<NAME>_<DATE>`; the catalog entries
/// contain the `<NAME>` part, which is the id with the 7 byte prefix and
/// the 4 byte suffix stripped.
pub fn module_ids(bytes: &[u8]) -> Result<Vec<String>, DocumentError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| DocumentError::NotJson)?;
    let devices = value
        .get("Devices")
        .and_then(Value::as_array)
        .ok_or(DocumentError::MissingKey("Devices"))?;

    let mut ids = Vec::with_capacity(devices.len());
    for device in devices {
        let id = device.get("id").and_then(Value::as_str).unwrap_or("");
        // Strip prefix and date suffix; short ids collapse to ""
        let inner = id.get(7..id.len().saturating_sub(4)).unwrap_or("");
        ids.push(inner.to_string());
    }
    Ok(ids)
}

/// Numbers may arrive as JSON numbers or as strings; accept both.
fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Digest cells published to PLC server clients.
///
/// The daemon mainloop is the only writer; connections read on `PH`/`RH`.
pub struct FileDigests {
    pictory: Mutex<Digest>,
    replace_ios: Mutex<Digest>,
}

impl FileDigests {
    pub fn new() -> Self {
        Self {
            pictory: Mutex::new(DIGEST_UNKNOWN),
            replace_ios: Mutex::new(DIGEST_ABSENT),
        }
    }

    pub fn pictory(&self) -> Digest {
        *self.pictory.lock().unwrap()
    }

    pub fn set_pictory(&self, digest: Digest) {
        *self.pictory.lock().unwrap() = digest;
    }

    pub fn replace_ios(&self) -> Digest {
        *self.replace_ios.lock().unwrap()
    }

    pub fn set_replace_ios(&self, digest: Digest) {
        *self.replace_ios.lock().unwrap() = digest;
    }
}

impl Default for FileDigests {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a file on disk, mapping absence to the absent sentinel.
pub fn digest_file(path: impl AsRef<Path>) -> Digest {
    match std::fs::read(path) {
        Ok(bytes) => digest_bytes(&bytes),
        Err(_) => DIGEST_ABSENT,
    }
}
