//! Typed block payloads.
//!
//! Each block type is a plain serde struct.  Structured fields go through
//! `serde_json` into the struct (which rejects unknown names and
//! out-of-range numbers), and the struct goes through `postcard` onto the
//! wire.  `postcard::from_bytes` stops after the last known field, so bytes
//! appended by newer firmware are ignored.

use core::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Fields, Transcoder};
use crate::error::CodecError;

/// Static description of one block type.
pub trait BlockData: Serialize + DeserializeOwned + 'static {
    const TYPE_ID: u16;
    const TYPE_NAME: &'static str;
    const LINKS: &'static [&'static str] = &[];

    /// Range checks beyond what the field types enforce.
    fn validate(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

/// Transcoder for any [`BlockData`] type.
pub struct PostcardTranscoder<T>(PhantomData<fn() -> T>);

impl<T: BlockData> PostcardTranscoder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: BlockData> Default for PostcardTranscoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: BlockData> Transcoder for PostcardTranscoder<T> {
    fn type_id(&self) -> u16 {
        T::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn link_fields(&self) -> &'static [&'static str] {
        T::LINKS
    }

    fn encode(&self, fields: &Fields) -> Result<Vec<u8>, CodecError> {
        let encode_err = |reason: String| CodecError::Encode {
            type_id: T::TYPE_ID,
            reason,
        };
        let value: T = serde_json::from_value(Value::Object(fields.clone()))
            .map_err(|e| encode_err(e.to_string()))?;
        value.validate().map_err(|e| encode_err(e.to_string()))?;
        postcard::to_allocvec(&value).map_err(|e| encode_err(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Fields, CodecError> {
        let decode_err = |reason: String| CodecError::Decode {
            type_id: T::TYPE_ID,
            reason,
        };
        let value: T = postcard::from_bytes(bytes).map_err(|e| decode_err(e.to_string()))?;
        value.validate().map_err(|e| decode_err(e.to_string()))?;
        match serde_json::to_value(&value).map_err(|e| decode_err(e.to_string()))? {
            Value::Object(map) => Ok(map),
            _ => Err(decode_err("payload is not a struct".into())),
        }
    }
}

pub(crate) fn builtin_transcoders() -> Vec<Box<dyn Transcoder>> {
    vec![
        Box::new(PostcardTranscoder::<SysInfo>::new()),
        Box::new(PostcardTranscoder::<Ticks>::new()),
        Box::new(PostcardTranscoder::<OneWireBus>::new()),
        Box::new(PostcardTranscoder::<TempSensorMock>::new()),
        Box::new(PostcardTranscoder::<TempSensorOneWire>::new()),
        Box::new(PostcardTranscoder::<SetpointSensorPair>::new()),
        Box::new(PostcardTranscoder::<Pid>::new()),
        Box::new(PostcardTranscoder::<ActuatorPwm>::new()),
        Box::new(PostcardTranscoder::<DisplaySettings>::new()),
        Box::new(PostcardTranscoder::<DigitalActuator>::new()),
    ]
}

fn finite(values: &[f64]) -> Result<(), &'static str> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err("numbers must be finite")
    }
}

// ── Shared enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Platform {
    #[default]
    Unknown,
    Gcc,
    Photon,
    P1,
    Esp32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TempUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DigitalState {
    #[default]
    Inactive,
    Active,
    Unknown,
    Reverse,
}

// ── System blocks ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct SysInfo {
    pub device_id: String,
    pub version: String,
    pub proto_version: String,
    pub platform: Platform,
    pub uptime_ms: u64,
    pub updates_per_second: u32,
}

impl BlockData for SysInfo {
    const TYPE_ID: u16 = 256;
    const TYPE_NAME: &'static str = "SysInfo";
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Ticks {
    pub seconds_since_epoch: u32,
    pub millis_since_boot: u64,
}

impl BlockData for Ticks {
    const TYPE_ID: u16 = 257;
    const TYPE_NAME: &'static str = "Ticks";
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct OneWireBus {
    pub command: u8,
    pub addresses: Vec<String>,
}

impl BlockData for OneWireBus {
    const TYPE_ID: u16 = 258;
    const TYPE_NAME: &'static str = "OneWireBus";

    fn validate(&self) -> Result<(), &'static str> {
        if self.addresses.iter().all(|a| is_onewire_address(a)) {
            Ok(())
        } else {
            Err("addresses must be 16 hex digits")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct DisplaySettings {
    pub name: String,
    pub temp_unit: TempUnit,
    pub brightness: u8,
}

impl BlockData for DisplaySettings {
    const TYPE_ID: u16 = 314;
    const TYPE_NAME: &'static str = "DisplaySettings";

    fn validate(&self) -> Result<(), &'static str> {
        if self.name.chars().count() > 40 {
            return Err("name is limited to 40 characters");
        }
        Ok(())
    }
}

// ── Sensors ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct TempSensorMock {
    pub value: f64,
    pub connected: bool,
    pub setting: f64,
}

impl BlockData for TempSensorMock {
    const TYPE_ID: u16 = 301;
    const TYPE_NAME: &'static str = "TempSensorMock";

    fn validate(&self) -> Result<(), &'static str> {
        finite(&[self.value, self.setting])
    }
}

fn is_onewire_address(address: &str) -> bool {
    address.len() == 16 && address.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct TempSensorOneWire {
    pub value: f64,
    pub offset: f64,
    pub address: String,
    pub connected: bool,
    pub one_wire_bus_id: u16,
}

impl BlockData for TempSensorOneWire {
    const TYPE_ID: u16 = 302;
    const TYPE_NAME: &'static str = "TempSensorOneWire";
    const LINKS: &'static [&'static str] = &["oneWireBusId"];

    fn validate(&self) -> Result<(), &'static str> {
        finite(&[self.value, self.offset])?;
        if !self.address.is_empty() && !is_onewire_address(&self.address) {
            return Err("address must be 16 hex digits");
        }
        Ok(())
    }
}

// ── Control ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct SetpointSensorPair {
    pub sensor_id: u16,
    pub setting: f64,
    pub value: f64,
    pub enabled: bool,
}

impl BlockData for SetpointSensorPair {
    const TYPE_ID: u16 = 303;
    const TYPE_NAME: &'static str = "SetpointSensorPair";
    const LINKS: &'static [&'static str] = &["sensorId"];

    fn validate(&self) -> Result<(), &'static str> {
        finite(&[self.setting, self.value])
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Pid {
    pub input_id: u16,
    pub output_id: u16,
    pub kp: f64,
    pub ti: u32,
    pub td: u32,
    pub enabled: bool,
    pub output_value: f64,
}

impl BlockData for Pid {
    const TYPE_ID: u16 = 304;
    const TYPE_NAME: &'static str = "Pid";
    const LINKS: &'static [&'static str] = &["inputId", "outputId"];

    fn validate(&self) -> Result<(), &'static str> {
        finite(&[self.kp, self.output_value])
    }
}

// ── Actuators ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ActuatorPwm {
    pub actuator_id: u16,
    pub setting: f64,
    pub value: f64,
    pub period_ms: u32,
    pub enabled: bool,
}

impl BlockData for ActuatorPwm {
    const TYPE_ID: u16 = 307;
    const TYPE_NAME: &'static str = "ActuatorPwm";
    const LINKS: &'static [&'static str] = &["actuatorId"];

    fn validate(&self) -> Result<(), &'static str> {
        let duty = 0.0..=100.0;
        if !duty.contains(&self.setting) || !duty.contains(&self.value) {
            return Err("duty cycle must be 0-100");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct DigitalActuator {
    pub hw_device: u16,
    pub channel: u8,
    pub desired_state: DigitalState,
    pub state: DigitalState,
    pub invert: bool,
}

impl BlockData for DigitalActuator {
    const TYPE_ID: u16 = 318;
    const TYPE_NAME: &'static str = "DigitalActuator";
    const LINKS: &'static [&'static str] = &["hwDevice"];
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn struct_fields_roundtrip() {
        let t = PostcardTranscoder::<Pid>::new();
        let input = fields(json!({
            "inputId": 101, "outputId": 102, "kp": 12.5, "ti": 600, "td": 60,
            "enabled": true, "outputValue": 0.0
        }));
        let bytes = t.encode(&input).unwrap();
        assert_eq!(t.decode(&bytes).unwrap(), input);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let t = PostcardTranscoder::<ActuatorPwm>::new();
        let bytes = t.encode(&fields(json!({ "setting": 40.0 }))).unwrap();
        let out = t.decode(&bytes).unwrap();
        assert_eq!(out["setting"], json!(40.0));
        assert_eq!(out["periodMs"], json!(0));
    }

    #[test]
    fn unknown_field_rejected_on_encode() {
        let t = PostcardTranscoder::<TempSensorMock>::new();
        let err = t.encode(&fields(json!({ "value": 1.0, "humidity": 3 }))).unwrap_err();
        assert!(matches!(err, CodecError::Encode { type_id: 301, .. }));
    }

    #[test]
    fn out_of_range_numbers_rejected() {
        let pwm = PostcardTranscoder::<ActuatorPwm>::new();
        assert!(pwm.encode(&fields(json!({ "setting": 140.0 }))).is_err());

        let display = PostcardTranscoder::<DisplaySettings>::new();
        assert!(display.encode(&fields(json!({ "brightness": 300 }))).is_err());

        // Out-of-range value in bytes: setting = 250.0 encoded directly.
        let raw = postcard::to_allocvec(&ActuatorPwm {
            setting: 250.0,
            ..ActuatorPwm::default()
        })
        .unwrap();
        assert!(matches!(pwm.decode(&raw), Err(CodecError::Decode { .. })));
    }

    #[test]
    fn wrong_length_and_bad_enum_rejected() {
        let t = PostcardTranscoder::<Pid>::new();
        let bytes = t.encode(&fields(json!({ "kp": 2.0 }))).unwrap();
        assert!(t.decode(&bytes[..bytes.len() - 3]).is_err());

        let actuator = PostcardTranscoder::<DigitalActuator>::new();
        // hw_device varint, channel, desired_state variant 9 (invalid)
        assert!(actuator.decode(&[0x05, 0x01, 0x09, 0x00, 0x00]).is_err());
    }

    #[test]
    fn trailing_bytes_from_newer_firmware_ignored() {
        let t = PostcardTranscoder::<TempSensorOneWire>::new();
        let input = fields(json!({
            "value": 19.25, "offset": -0.5, "address": "28C80E9A0300009D",
            "connected": true, "oneWireBusId": 4
        }));
        let mut bytes = t.encode(&input).unwrap();
        bytes.extend_from_slice(&[0x07, 0xFF, 0x00, 0x42]);
        assert_eq!(t.decode(&bytes).unwrap(), input);
    }

    #[test]
    fn onewire_address_validated() {
        let t = PostcardTranscoder::<TempSensorOneWire>::new();
        assert!(t.encode(&fields(json!({ "address": "not-an-address" }))).is_err());
    }
}
