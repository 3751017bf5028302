//! Controller welcome message.
//!
//! On connect (and in answer to a `Version` prompt) the controller emits an
//! event annotation:
//!
//! ```text
//! <!CONTROLBOX,name,firmware_version,proto_version,firmware_date,proto_date,
//!   system_version,platform,reset_reason,reset_data,device_id>
//! ```

use serde::Serialize;

pub const WELCOME_PREFIX: &str = "CONTROLBOX";

/// Significant prefix of version hashes.
const VERSION_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handshake {
    pub name: String,
    pub firmware_version: String,
    pub proto_version: String,
    pub firmware_date: String,
    pub proto_date: String,
    pub system_version: String,
    pub platform: String,
    pub reset_reason: String,
    pub reset_data: String,
    pub device_id: String,
}

impl Handshake {
    /// Parse an event annotation (marker already stripped).
    pub fn parse(event: &str) -> Option<Self> {
        let mut parts = event.split(',').map(str::trim);
        if parts.next()? != WELCOME_PREFIX {
            return None;
        }
        let mut next = || parts.next().map(str::to_string);
        Some(Self {
            name: next()?,
            firmware_version: next()?,
            proto_version: next()?,
            firmware_date: next()?,
            proto_date: next()?,
            system_version: next()?,
            platform: next()?,
            reset_reason: next()?.to_uppercase(),
            reset_data: next()?.to_uppercase(),
            device_id: next().unwrap_or_default().to_lowercase(),
        })
    }

    /// Event text as the controller sends it (without the annotation brackets).
    pub fn to_event(&self) -> String {
        format!(
            "!{},{},{},{},{},{},{},{},{},{},{}",
            WELCOME_PREFIX,
            self.name,
            self.firmware_version,
            self.proto_version,
            self.firmware_date,
            self.proto_date,
            self.system_version,
            self.platform,
            self.reset_reason,
            self.reset_data,
            self.device_id
        )
    }

    /// Protocol version truncated to its significant prefix.
    pub fn short_proto_version(&self) -> &str {
        truncate_version(&self.proto_version)
    }
}

pub fn truncate_version(version: &str) -> &str {
    match version.char_indices().nth(VERSION_LEN) {
        Some((idx, _)) => &version[..idx],
        None => version,
    }
}
