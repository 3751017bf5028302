//! Hand-laid-out payloads that predate the struct encoding.

use serde_json::{Value, json};

use super::{Fields, Transcoder};
use crate::error::CodecError;

const GROUP_COUNT: u64 = 8;

/// Placeholder for a block whose type this firmware no longer supports.
///
/// Payload: `[actual_type_id u16 LE]`.
pub struct DeprecatedObjectTranscoder;

impl Transcoder for DeprecatedObjectTranscoder {
    fn type_id(&self) -> u16 {
        65533
    }

    fn type_name(&self) -> &'static str {
        "DeprecatedObject"
    }

    fn encode(&self, fields: &Fields) -> Result<Vec<u8>, CodecError> {
        let actual = fields
            .get("actualId")
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| CodecError::Encode {
                type_id: self.type_id(),
                reason: "actualId must be an integer 0-65535".into(),
            })?;
        Ok(actual.to_le_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Fields, CodecError> {
        let [lo, hi, ..] = bytes else {
            return Err(CodecError::Decode {
                type_id: self.type_id(),
                reason: format!("expected 2 bytes, got {}", bytes.len()),
            });
        };
        let mut fields = Fields::new();
        fields.insert("actualId".into(), json!(u16::from_le_bytes([*lo, *hi])));
        Ok(fields)
    }
}

/// Active group set.
///
/// Payload: one byte, bit `n` set when group `n` is active.  Structured
/// form: `{"active": [n, ...]}` in ascending order.
pub struct GroupsTranscoder;

impl Transcoder for GroupsTranscoder {
    fn type_id(&self) -> u16 {
        65534
    }

    fn type_name(&self) -> &'static str {
        "Groups"
    }

    fn encode(&self, fields: &Fields) -> Result<Vec<u8>, CodecError> {
        let encode_err = |reason: &str| CodecError::Encode {
            type_id: self.type_id(),
            reason: reason.into(),
        };
        let active = fields
            .get("active")
            .and_then(Value::as_array)
            .ok_or_else(|| encode_err("active must be a list"))?;

        let mut mask = 0u8;
        for group in active {
            match group.as_u64() {
                Some(n) if n < GROUP_COUNT => mask |= 1u8 << n,
                _ => return Err(encode_err("groups are numbered 0-7")),
            }
        }
        Ok(vec![mask])
    }

    fn decode(&self, bytes: &[u8]) -> Result<Fields, CodecError> {
        let &mask = bytes.first().ok_or_else(|| CodecError::Decode {
            type_id: self.type_id(),
            reason: "empty payload".into(),
        })?;
        let active: Vec<u64> = (0..GROUP_COUNT).filter(|n| mask & (1u8 << *n) != 0).collect();

        let mut fields = Fields::new();
        fields.insert("active".into(), json!(active));
        Ok(fields)
    }
}
