//! Command and response payloads carried inside frames.
//!
//! Request:
//! ```text
//! ┌────────┬───────┬────────────┬─────────────┬───────────┐
//! │ opcode │ flags │ nid u16 LE │ type u16 LE │ data …    │
//! │   u8   │  u8   │ (bit 0)    │ (bit 1)     │ (bit 2)   │
//! └────────┴───────┴────────────┴─────────────┴───────────┘
//! ```
//! Response:
//! ```text
//! ┌──────────────┬──────────────────┬────────┬──────────────────────────────┐
//! │ echo_len u16 │ echoed request   │ status │ { nid, type, len, data } *   │
//! └──────────────┴──────────────────┴────────┴──────────────────────────────┘
//! ```
//!
//! The wire gives no correlation id: a response is tied to its request
//! only through the echoed request bytes.

use core::fmt;

const FLAG_NID: u8 = 0b0000_0001;
const FLAG_TYPE: u8 = 0b0000_0010;
const FLAG_DATA: u8 = 0b0000_0100;

/// Type id carried by name objects.
pub const NAME_TYPE_ID: u16 = 0;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    None = 0,
    Version = 1,
    BlockRead = 10,
    BlockReadAll = 11,
    BlockWrite = 12,
    BlockCreate = 13,
    BlockDelete = 14,
    BlockDiscover = 15,
    NameRead = 20,
    NameReadAll = 21,
    NameWrite = 22,
    Reboot = 30,
    ClearBlocks = 31,
    FactoryReset = 33,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Version,
            10 => Self::BlockRead,
            11 => Self::BlockReadAll,
            12 => Self::BlockWrite,
            13 => Self::BlockCreate,
            14 => Self::BlockDelete,
            15 => Self::BlockDiscover,
            20 => Self::NameRead,
            21 => Self::NameReadAll,
            22 => Self::NameWrite,
            30 => Self::Reboot,
            31 => Self::ClearBlocks,
            33 => Self::FactoryReset,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Controller status byte.  Codes this host does not know are preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    UnknownError,
    InvalidOpcode,
    InsufficientHeap,
    InsufficientStorage,
    NetworkError,
    NetworkReadError,
    NetworkDecodingError,
    NetworkWriteError,
    NetworkEncodingError,
    StorageError,
    StorageReadError,
    StorageDecodingError,
    StorageCrcError,
    StorageWriteError,
    StorageEncodingError,
    BlockNotWritable,
    BlockNotReadable,
    BlockNotCreatable,
    BlockNotDeletable,
    InvalidBlock,
    InvalidBlockId,
    InvalidBlockType,
    InvalidBlockSubtype,
    InvalidBlockContent,
    InvalidStoredBlock,
    InvalidStoredBlockId,
    InvalidStoredBlockType,
    InvalidStoredBlockSubtype,
    InvalidStoredBlockContent,
    Other(u8),
}

impl ErrorCode {
    const TABLE: [(u8, Self); 30] = [
        (0, Self::Ok),
        (1, Self::UnknownError),
        (2, Self::InvalidOpcode),
        (4, Self::InsufficientHeap),
        (5, Self::InsufficientStorage),
        (10, Self::NetworkError),
        (11, Self::NetworkReadError),
        (12, Self::NetworkDecodingError),
        (13, Self::NetworkWriteError),
        (14, Self::NetworkEncodingError),
        (20, Self::StorageError),
        (21, Self::StorageReadError),
        (22, Self::StorageDecodingError),
        (23, Self::StorageCrcError),
        (24, Self::StorageWriteError),
        (25, Self::StorageEncodingError),
        (30, Self::BlockNotWritable),
        (31, Self::BlockNotReadable),
        (32, Self::BlockNotCreatable),
        (33, Self::BlockNotDeletable),
        (40, Self::InvalidBlock),
        (41, Self::InvalidBlockId),
        (42, Self::InvalidBlockType),
        (43, Self::InvalidBlockSubtype),
        (44, Self::InvalidBlockContent),
        (50, Self::InvalidStoredBlock),
        (51, Self::InvalidStoredBlockId),
        (52, Self::InvalidStoredBlockType),
        (53, Self::InvalidStoredBlockSubtype),
        (54, Self::InvalidStoredBlockContent),
    ];

    pub fn from_u8(value: u8) -> Self {
        Self::TABLE
            .iter()
            .find(|(code, _)| *code == value)
            .map_or(Self::Other(value), |(_, e)| *e)
    }

    pub fn as_u8(self) -> u8 {
        if let Self::Other(value) = self {
            return value;
        }
        Self::TABLE
            .iter()
            .find(|(_, e)| *e == self)
            .map_or(1, |(code, _)| *code)
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "error code {code}"),
            known => write!(f, "{known:?} ({})", known.as_u8()),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload decode failures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    Empty,
    UnknownOpcode(u8),
    Truncated(&'static str),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty payload"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            Self::Truncated(what) => write!(f, "truncated {what}"),
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self, what: &'static str) -> Result<u8, PayloadError> {
        let (&first, rest) = self.bytes.split_first().ok_or(PayloadError::Truncated(what))?;
        self.bytes = rest;
        Ok(first)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, PayloadError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], PayloadError> {
        if self.bytes.len() < len {
            return Err(PayloadError::Truncated(what));
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// One object as carried on the wire: numeric id, type id, encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedObject {
    pub nid: u16,
    pub type_id: u16,
    pub data: Vec<u8>,
}

impl EncodedObject {
    pub fn new(nid: u16, type_id: u16, data: Vec<u8>) -> Self {
        Self { nid, type_id, data }
    }

    /// Name objects carry UTF-8 text.
    pub fn name(&self) -> Option<&str> {
        (self.type_id == NAME_TYPE_ID)
            .then(|| core::str::from_utf8(&self.data).ok())
            .flatten()
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A request to the controller.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    nid: Option<u16>,
    type_id: Option<u16>,
    data: Option<Vec<u8>>,
}

impl Command {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            nid: None,
            type_id: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, nid: u16) -> Self {
        self.nid = Some(nid);
        self
    }

    #[must_use]
    pub fn with_object(mut self, type_id: u16, data: Vec<u8>) -> Self {
        self.type_id = Some(type_id);
        self.data = Some(data);
        self
    }

    pub fn read(nid: u16) -> Self {
        Self::new(Opcode::BlockRead).with_target(nid)
    }

    pub fn read_all() -> Self {
        Self::new(Opcode::BlockReadAll)
    }

    pub fn write(nid: u16, type_id: u16, data: Vec<u8>) -> Self {
        Self::new(Opcode::BlockWrite)
            .with_target(nid)
            .with_object(type_id, data)
    }

    pub fn create(type_id: u16, data: Vec<u8>) -> Self {
        Self::new(Opcode::BlockCreate).with_object(type_id, data)
    }

    pub fn delete(nid: u16) -> Self {
        Self::new(Opcode::BlockDelete).with_target(nid)
    }

    pub fn write_name(nid: u16, name: &str) -> Self {
        Self::new(Opcode::NameWrite)
            .with_target(nid)
            .with_object(NAME_TYPE_ID, name.as_bytes().to_vec())
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn nid(&self) -> Option<u16> {
        self.nid
    }

    pub fn type_id(&self) -> Option<u16> {
        self.type_id
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0;
        let mut out = Vec::with_capacity(6 + self.data.as_ref().map_or(0, Vec::len));
        out.push(self.opcode as u8);
        out.push(0);
        if let Some(nid) = self.nid {
            flags |= FLAG_NID;
            out.extend_from_slice(&nid.to_le_bytes());
        }
        if let Some(type_id) = self.type_id {
            flags |= FLAG_TYPE;
            out.extend_from_slice(&type_id.to_le_bytes());
        }
        if let Some(data) = &self.data {
            flags |= FLAG_DATA;
            out.extend_from_slice(data);
        }
        out[1] = flags;
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.is_empty() {
            return Err(PayloadError::Empty);
        }
        let mut reader = Reader { bytes: payload };
        let raw = reader.u8("opcode")?;
        let opcode = Opcode::from_u8(raw).ok_or(PayloadError::UnknownOpcode(raw))?;
        let flags = reader.u8("flags")?;

        let nid = if flags & FLAG_NID != 0 {
            Some(reader.u16("nid")?)
        } else {
            None
        };
        let type_id = if flags & FLAG_TYPE != 0 {
            Some(reader.u16("type")?)
        } else {
            None
        };
        let data = (flags & FLAG_DATA != 0).then(|| reader.bytes.to_vec());

        Ok(Self {
            opcode,
            nid,
            type_id,
            data,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.opcode)?;
        if let Some(nid) = self.nid {
            write!(f, " nid={nid}")?;
        }
        if let Some(type_id) = self.type_id {
            write!(f, " type={type_id}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The decoded result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: Command,
    pub status: ErrorCode,
    pub objects: Vec<EncodedObject>,
}

impl Response {
    pub fn new(command: Command, status: ErrorCode, objects: Vec<EncodedObject>) -> Self {
        Self {
            command,
            status,
            objects,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let echo = self.command.encode();
        let mut out = Vec::with_capacity(echo.len() + 3);
        out.extend_from_slice(&(echo.len() as u16).to_le_bytes());
        out.extend_from_slice(&echo);
        out.push(self.status.as_u8());
        for obj in &self.objects {
            out.extend_from_slice(&obj.nid.to_le_bytes());
            out.extend_from_slice(&obj.type_id.to_le_bytes());
            out.extend_from_slice(&(obj.data.len() as u16).to_le_bytes());
            out.extend_from_slice(&obj.data);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = Reader { bytes: payload };
        let echo_len = reader.u16("echo length")? as usize;
        let command = Command::decode(reader.take(echo_len, "echo")?)?;
        let status = ErrorCode::from_u8(reader.u8("status")?);

        let mut objects = Vec::new();
        while !reader.bytes.is_empty() {
            let nid = reader.u16("object id")?;
            let type_id = reader.u16("object type")?;
            let len = reader.u16("object length")? as usize;
            let data = reader.take(len, "object data")?.to_vec();
            objects.push(EncodedObject { nid, type_id, data });
        }

        Ok(Self {
            command,
            status,
            objects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_flags_mark_present_fields() {
        let cmd = Command::read(300);
        assert_eq!(cmd.encode(), vec![10, FLAG_NID, 0x2C, 0x01]);

        let bare = Command::read_all();
        assert_eq!(bare.encode(), vec![11, 0]);
    }

    #[test]
    fn command_decode_restores_all_fields() {
        let cmd = Command::write(101, 302, vec![1, 2, 3]);
        let back = Command::decode(&cmd.encode()).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.data(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn response_carries_echo_and_objects() {
        let resp = Response::new(
            Command::read_all(),
            ErrorCode::Ok,
            vec![
                EncodedObject::new(2, 256, vec![9; 4]),
                EncodedObject::new(100, 301, vec![]),
            ],
        );
        let back = Response::decode(&resp.encode()).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn truncated_object_is_rejected() {
        let resp = Response::new(
            Command::read(5),
            ErrorCode::Ok,
            vec![EncodedObject::new(5, 301, vec![1, 2, 3])],
        );
        let mut wire = resp.encode();
        wire.pop();
        assert_eq!(
            Response::decode(&wire),
            Err(PayloadError::Truncated("object data"))
        );
    }

    #[test]
    fn unknown_status_codes_are_preserved() {
        assert_eq!(ErrorCode::from_u8(42), ErrorCode::InvalidBlockType);
        assert_eq!(ErrorCode::from_u8(200), ErrorCode::Other(200));
        assert_eq!(ErrorCode::Other(200).as_u8(), 200);
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert_eq!(Command::decode(&[99, 0]), Err(PayloadError::UnknownOpcode(99)));
    }

    #[test]
    fn name_objects_expose_text() {
        let obj = EncodedObject::new(100, NAME_TYPE_ID, b"fridge-sensor".to_vec());
        assert_eq!(obj.name(), Some("fridge-sensor"));
        assert_eq!(EncodedObject::new(100, 301, vec![]).name(), None);
    }
}
