//! Object codec: per-type transcoders behind one registry.
//!
//! ```text
//!   structured fields ──encode──▶ Transcoder(type id) ──▶ bytes
//!   bytes ──────────────decode──▶ Transcoder(type id) ──▶ structured fields
//! ```
//!
//! The registry maps a numeric type id to exactly one [`Transcoder`].  It is
//! built once at startup, then shared read-only (usually behind an `Arc`).
//! Every transcoder must tolerate bytes appended by newer controller
//! firmware: unknown trailing data is ignored, never an error.

pub mod blocks;
pub mod raw;

use std::collections::BTreeMap;

use log::debug;

use crate::error::{CodecError, TypeRef};

/// Structured object payload: field name → value.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Encode/decode capability for one object type.
pub trait Transcoder: Send + Sync {
    fn type_id(&self) -> u16;

    fn type_name(&self) -> &'static str;

    /// Fields holding the numeric id of another block.
    fn link_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn encode(&self, fields: &Fields) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Fields, CodecError>;
}

// ── Registry ─────────────────────────────────────────────────

pub struct ObjectCodec {
    transcoders: BTreeMap<u16, Box<dyn Transcoder>>,
    names: BTreeMap<&'static str, u16>,
}

impl ObjectCodec {
    pub fn builder() -> CodecBuilder {
        CodecBuilder {
            transcoders: Vec::new(),
        }
    }

    /// Registry holding every built-in block type.
    pub fn standard() -> Result<Self, CodecError> {
        Self::builder().with_builtins().build()
    }

    pub fn encode(&self, type_id: u16, fields: &Fields) -> Result<Vec<u8>, CodecError> {
        self.transcoder(type_id)?.encode(fields)
    }

    pub fn decode(&self, type_id: u16, bytes: &[u8]) -> Result<Fields, CodecError> {
        self.transcoder(type_id)?.decode(bytes)
    }

    pub fn transcoder(&self, type_id: u16) -> Result<&dyn Transcoder, CodecError> {
        self.transcoders
            .get(&type_id)
            .map(|t| &**t)
            .ok_or(CodecError::UnknownType(TypeRef::Id(type_id)))
    }

    /// Look up a type id by name.
    pub fn type_id(&self, name: &str) -> Result<u16, CodecError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| CodecError::UnknownType(TypeRef::Name(name.to_string())))
    }

    pub fn type_name(&self, type_id: u16) -> Option<&'static str> {
        self.transcoders.get(&type_id).map(|t| t.type_name())
    }

    pub fn link_fields(&self, type_id: u16) -> &'static [&'static str] {
        match self.transcoders.get(&type_id) {
            Some(t) => t.link_fields(),
            None => &[],
        }
    }

    pub fn type_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.transcoders.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.transcoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transcoders.is_empty()
    }
}

impl core::fmt::Debug for ObjectCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.names.iter()).finish()
    }
}

/// Collects transcoders; duplicates are rejected by [`build`](Self::build).
pub struct CodecBuilder {
    transcoders: Vec<Box<dyn Transcoder>>,
}

impl CodecBuilder {
    #[must_use]
    pub fn register(mut self, transcoder: impl Transcoder + 'static) -> Self {
        self.transcoders.push(Box::new(transcoder));
        self
    }

    #[must_use]
    pub fn with_builtins(mut self) -> Self {
        self.transcoders.extend(blocks::builtin_transcoders());
        self.transcoders.push(Box::new(raw::DeprecatedObjectTranscoder));
        self.transcoders.push(Box::new(raw::GroupsTranscoder));
        self
    }

    pub fn build(self) -> Result<ObjectCodec, CodecError> {
        let mut transcoders = BTreeMap::new();
        let mut names = BTreeMap::new();
        for transcoder in self.transcoders {
            let id = transcoder.type_id();
            if transcoders.contains_key(&id) || names.contains_key(transcoder.type_name()) {
                return Err(CodecError::DuplicateType(id));
            }
            names.insert(transcoder.type_name(), id);
            transcoders.insert(id, transcoder);
        }
        debug!("Codec: {} transcoders registered", transcoders.len());
        Ok(ObjectCodec { transcoders, names })
    }
}
