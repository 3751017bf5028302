//! In-process simulated controller.
//!
//! Speaks the same framed protocol as real firmware, so everything above the
//! [`Transport`] seam runs unmodified against it.  Used by the `simulation`
//! connection target and by the integration tests, which reach into the
//! [`SimHandle`] to inject faults:
//!
//! ```text
//!   Commander ──frames──▶ SimTransport ──▶ SimDevice (blocks, names)
//!             ◀──frames── (latency, drops, corruption, duplicates)
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use super::codec::{FrameDecoder, FrameEvent, encode_annotation, encode_frame};
use super::command::{Command, EncodedObject, ErrorCode, NAME_TYPE_ID, Opcode, Response};
use super::handshake::Handshake;
use super::transport::Transport;
use crate::codec::blocks::{
    BlockData, DisplaySettings, OneWireBus, Platform, SysInfo, TempUnit, Ticks,
};
use crate::config::EngineConfig;
use crate::datastore::USER_NID_START;

const SIM_FRAME_LIMIT: usize = 16 * 1024;
const GROUPS_TYPE_ID: u16 = 65534;

// ── Device model ─────────────────────────────────────────────

struct Reply {
    annotations: Vec<Vec<u8>>,
    frames: Vec<Vec<u8>>,
}

struct SimDevice {
    handshake: Handshake,
    blocks: BTreeMap<u16, (u16, Vec<u8>)>,
    names: BTreeMap<u16, String>,

    // fault injection
    mute: bool,
    drop_next: u32,
    corrupt_next: u32,
    duplicate_next: u32,
    latency_polls: u32,
    disconnect: bool,
    injected: VecDeque<u8>,

    // observation
    requests: u64,
    outstanding: usize,
    max_outstanding: usize,
}

fn system_block<T: BlockData>(value: &T) -> (u16, Vec<u8>) {
    (T::TYPE_ID, postcard::to_allocvec(value).unwrap_or_default())
}

impl Default for SimDevice {
    fn default() -> Self {
        let proto_version = EngineConfig::default().proto_version;
        let device_id = "5a1d0c0ffee5".to_string();

        let mut blocks = BTreeMap::new();
        blocks.insert(1, (GROUPS_TYPE_ID, vec![0b0000_0001]));
        blocks.insert(
            2,
            system_block(&SysInfo {
                device_id: device_id.clone(),
                version: "sim-1.0.0".into(),
                proto_version: proto_version.clone(),
                platform: Platform::Gcc,
                uptime_ms: 0,
                updates_per_second: 10,
            }),
        );
        blocks.insert(3, system_block(&Ticks::default()));
        blocks.insert(4, system_block(&OneWireBus::default()));
        blocks.insert(
            7,
            system_block(&DisplaySettings {
                name: "Simulator".into(),
                temp_unit: TempUnit::Celsius,
                brightness: 200,
            }),
        );

        Self {
            handshake: Handshake {
                name: "simulator".into(),
                firmware_version: "sim-1.0.0".into(),
                proto_version,
                firmware_date: "2024-01-01".into(),
                proto_date: "2024-01-01".into(),
                system_version: "1.0.0".into(),
                platform: "sim".into(),
                reset_reason: "00".into(),
                reset_data: "00".into(),
                device_id,
            },
            blocks,
            names: BTreeMap::new(),
            mute: false,
            drop_next: 0,
            corrupt_next: 0,
            duplicate_next: 0,
            latency_polls: 0,
            disconnect: false,
            injected: VecDeque::new(),
            requests: 0,
            outstanding: 0,
            max_outstanding: 0,
        }
    }
}

impl SimDevice {
    fn welcome(&self) -> Vec<u8> {
        encode_annotation(&self.handshake.to_event())
    }

    fn object(&self, nid: u16) -> Option<EncodedObject> {
        self.blocks
            .get(&nid)
            .map(|(type_id, data)| EncodedObject::new(nid, *type_id, data.clone()))
    }

    fn next_free_nid(&self) -> Option<u16> {
        (USER_NID_START..=u16::MAX).find(|nid| !self.blocks.contains_key(nid))
    }

    fn clear_user_blocks(&mut self) {
        self.blocks.retain(|nid, _| *nid < USER_NID_START);
        self.names.retain(|nid, _| *nid < USER_NID_START);
    }

    fn handle(&mut self, payload: &[u8]) -> Reply {
        let mut reply = Reply {
            annotations: Vec::new(),
            frames: Vec::new(),
        };
        self.requests += 1;

        if self.mute {
            debug!("Sim: muted, dropping request");
            return reply;
        }
        if self.drop_next > 0 {
            self.drop_next -= 1;
            debug!("Sim: dropping request");
            return reply;
        }
        let command = match Command::decode(payload) {
            Ok(command) => command,
            Err(e) => {
                reply
                    .annotations
                    .push(encode_annotation(&format!("bad request: {e}")));
                return reply;
            }
        };

        let (status, objects) = self.execute(&command, &mut reply.annotations);
        let Some(mut frame) =
            encode_frame(&Response::new(command, status, objects).encode(), SIM_FRAME_LIMIT)
        else {
            return reply;
        };

        if self.corrupt_next > 0 {
            self.corrupt_next -= 1;
            // flip one hex digit of the checksum
            let at = frame.len().saturating_sub(2);
            frame[at] = if frame[at] == b'0' { b'1' } else { b'0' };
        }
        let copies = if self.duplicate_next > 0 {
            self.duplicate_next -= 1;
            2
        } else {
            1
        };
        for _ in 0..copies {
            reply.frames.push(frame.clone());
        }
        self.outstanding += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding);
        reply
    }

    fn execute(
        &mut self,
        command: &Command,
        annotations: &mut Vec<Vec<u8>>,
    ) -> (ErrorCode, Vec<EncodedObject>) {
        use ErrorCode::*;

        let nid = command.nid();
        match command.opcode() {
            Opcode::None => (Ok, vec![]),
            Opcode::Version => {
                annotations.push(self.welcome());
                (Ok, vec![])
            }
            Opcode::BlockRead => match nid.and_then(|nid| self.object(nid)) {
                Some(obj) => (Ok, vec![obj]),
                None => (InvalidBlockId, vec![]),
            },
            Opcode::BlockReadAll => {
                let all = self.blocks.keys().filter_map(|nid| self.object(*nid));
                (Ok, all.collect())
            }
            Opcode::BlockDiscover => {
                let all = self
                    .blocks
                    .iter()
                    .map(|(nid, (type_id, _))| EncodedObject::new(*nid, *type_id, Vec::new()));
                (Ok, all.collect())
            }
            Opcode::BlockWrite => {
                let (Some(nid), Some(type_id), Some(data)) =
                    (nid, command.type_id(), command.data())
                else {
                    return (InvalidBlock, vec![]);
                };
                match self.blocks.get_mut(&nid) {
                    None => (InvalidBlockId, vec![]),
                    Some((existing, _)) if *existing != type_id => (InvalidBlockType, vec![]),
                    Some(block) => {
                        block.1 = data.to_vec();
                        (Ok, self.object(nid).into_iter().collect())
                    }
                }
            }
            Opcode::BlockCreate => {
                let (Some(type_id), Some(data)) = (command.type_id(), command.data()) else {
                    return (InvalidBlock, vec![]);
                };
                let nid = match nid {
                    Some(nid) if nid < USER_NID_START || self.blocks.contains_key(&nid) => {
                        return (InvalidBlockId, vec![]);
                    }
                    Some(nid) => nid,
                    None => match self.next_free_nid() {
                        Some(nid) => nid,
                        None => return (InsufficientHeap, vec![]),
                    },
                };
                self.blocks.insert(nid, (type_id, data.to_vec()));
                (Ok, self.object(nid).into_iter().collect())
            }
            Opcode::BlockDelete => match nid {
                Some(nid) if nid < USER_NID_START => (BlockNotDeletable, vec![]),
                Some(nid) if self.blocks.remove(&nid).is_some() => {
                    self.names.remove(&nid);
                    (Ok, vec![])
                }
                _ => (InvalidBlockId, vec![]),
            },
            Opcode::NameRead => match nid.and_then(|nid| self.names.get(&nid).map(|n| (nid, n))) {
                Some((nid, name)) => (
                    Ok,
                    vec![EncodedObject::new(nid, NAME_TYPE_ID, name.as_bytes().to_vec())],
                ),
                None => (InvalidBlockId, vec![]),
            },
            Opcode::NameReadAll => {
                let all = self.names.iter().map(|(nid, name)| {
                    EncodedObject::new(*nid, NAME_TYPE_ID, name.as_bytes().to_vec())
                });
                (Ok, all.collect())
            }
            Opcode::NameWrite => {
                let (Some(nid), Some(data)) = (nid, command.data()) else {
                    return (InvalidBlock, vec![]);
                };
                let Some(name) = core::str::from_utf8(data).ok() else {
                    return (InvalidBlock, vec![]);
                };
                if !self.blocks.contains_key(&nid) {
                    return (InvalidBlockId, vec![]);
                }
                self.names.insert(nid, name.to_string());
                (Ok, vec![EncodedObject::new(nid, NAME_TYPE_ID, data.to_vec())])
            }
            Opcode::Reboot => {
                self.disconnect = true;
                (Ok, vec![])
            }
            Opcode::ClearBlocks | Opcode::FactoryReset => {
                self.clear_user_blocks();
                (Ok, vec![])
            }
        }
    }
}

// ── Shared handle ────────────────────────────────────────────

/// Cloneable handle to one simulated controller.
#[derive(Clone, Default)]
pub struct SimHandle {
    device: Arc<Mutex<SimDevice>>,
}

impl SimHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn device(&self) -> MutexGuard<'_, SimDevice> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a block directly in controller memory.
    pub fn insert_block(&self, nid: u16, type_id: u16, data: Vec<u8>) {
        self.device().blocks.insert(nid, (type_id, data));
    }

    pub fn remove_block(&self, nid: u16) {
        let mut dev = self.device();
        dev.blocks.remove(&nid);
        dev.names.remove(&nid);
    }

    pub fn block(&self, nid: u16) -> Option<(u16, Vec<u8>)> {
        self.device().blocks.get(&nid).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.device().blocks.len()
    }

    /// Store an id token next to a block, as earlier host versions did.
    pub fn set_name(&self, nid: u16, name: &str) {
        self.device().names.insert(nid, name.to_string());
    }

    pub fn name(&self, nid: u16) -> Option<String> {
        self.device().names.get(&nid).cloned()
    }

    pub fn set_proto_version(&self, version: &str) {
        self.device().handshake.proto_version = version.to_string();
    }

    pub fn set_device_id(&self, device_id: &str) {
        self.device().handshake.device_id = device_id.to_string();
    }

    pub fn handshake(&self) -> Handshake {
        self.device().handshake.clone()
    }

    /// Swallow every request until unmuted.
    pub fn set_mute(&self, mute: bool) {
        self.device().mute = mute;
    }

    pub fn drop_next(&self, count: u32) {
        self.device().drop_next = count;
    }

    /// Corrupt the checksum of the next `count` responses.
    pub fn corrupt_next(&self, count: u32) {
        self.device().corrupt_next = count;
    }

    /// Send the next `count` responses twice.
    pub fn duplicate_next(&self, count: u32) {
        self.device().duplicate_next = count;
    }

    /// Hold every reply for `polls` transport reads.
    pub fn set_latency(&self, polls: u32) {
        self.device().latency_polls = polls;
    }

    /// Queue raw bytes for the host, bypassing request handling.
    pub fn inject(&self, bytes: &[u8]) {
        self.device().injected.extend(bytes.iter().copied());
    }

    /// Fail the next transport read, as if the cable was pulled.
    pub fn disconnect(&self) {
        self.device().disconnect = true;
    }

    pub fn requests(&self) -> u64 {
        self.device().requests
    }

    /// Largest number of requests seen awaiting a reply at once.
    pub fn max_outstanding(&self) -> usize {
        self.device().max_outstanding
    }
}

// ── Transport ────────────────────────────────────────────────

struct Delayed {
    polls_left: u32,
    bytes: Vec<u8>,
    answers: bool,
}

/// One connection to a [`SimHandle`].
pub struct SimTransport {
    device: SimHandle,
    decoder: FrameDecoder,
    delayed: VecDeque<Delayed>,
    outbound: VecDeque<u8>,
}

impl SimTransport {
    /// Open a connection.  The controller greets with its welcome message.
    pub fn connect(device: &SimHandle) -> Self {
        let welcome = {
            let mut dev = device.device();
            dev.disconnect = false;
            dev.outstanding = 0;
            dev.injected.clear();
            dev.welcome()
        };
        info!("Sim: connection opened");
        Self {
            device: device.clone(),
            decoder: FrameDecoder::new(SIM_FRAME_LIMIT),
            delayed: VecDeque::new(),
            outbound: welcome.into(),
        }
    }

    fn release_due(&mut self, dev: &mut SimDevice) {
        for pending in self.delayed.iter_mut() {
            pending.polls_left = pending.polls_left.saturating_sub(1);
        }
        while self.delayed.front().is_some_and(|d| d.polls_left == 0) {
            let Some(ready) = self.delayed.pop_front() else {
                break;
            };
            if ready.answers {
                dev.outstanding = dev.outstanding.saturating_sub(1);
            }
            self.outbound.extend(ready.bytes);
        }
    }
}

impl Transport for SimTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let device = self.device.clone();
        let mut dev = device.device();
        if dev.disconnect {
            dev.disconnect = false;
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let injected: Vec<u8> = dev.injected.drain(..).collect();
        self.outbound.extend(injected);
        self.release_due(&mut dev);
        drop(dev);

        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut payloads = Vec::new();
        for event in self.decoder.feed(data) {
            match event {
                FrameEvent::Frame(frame) => payloads.push(frame.into_payload()),
                FrameEvent::Annotation(_) => {}
                FrameEvent::Corrupt(fault) => debug!("Sim: corrupt request: {}", fault),
            }
        }

        let mut dev = self.device.device();
        let polls = dev.latency_polls + 1;
        for payload in payloads {
            let reply = dev.handle(&payload);
            for bytes in reply.annotations {
                self.delayed.push_back(Delayed {
                    polls_left: polls,
                    bytes,
                    answers: false,
                });
            }
            let answered = !reply.frames.is_empty();
            let bytes = reply.frames.concat();
            if answered {
                self.delayed.push_back(Delayed {
                    polls_left: polls,
                    bytes,
                    answers: true,
                });
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(transport: &mut SimTransport, command: Command) -> Response {
        let frame = encode_frame(&command.encode(), 4096).unwrap();
        transport.write(&frame).unwrap();

        let mut decoder = FrameDecoder::new(SIM_FRAME_LIMIT);
        let mut buf = [0u8; 1024];
        for _ in 0..10 {
            let n = transport.read(&mut buf).unwrap();
            for event in decoder.feed(&buf[..n]) {
                if let FrameEvent::Frame(frame) = event {
                    return Response::decode(frame.payload()).unwrap();
                }
            }
        }
        panic!("no response");
    }

    #[test]
    fn greets_on_connect() {
        let sim = SimHandle::new();
        let mut transport = SimTransport::connect(&sim);
        let mut buf = [0u8; 512];
        let n = transport.read(&mut buf).unwrap();
        assert!(buf[..n].starts_with(b"<!CONTROLBOX,simulator,"));
    }

    #[test]
    fn create_assigns_user_ids() {
        let sim = SimHandle::new();
        let mut transport = SimTransport::connect(&sim);
        let resp = roundtrip(&mut transport, Command::create(301, vec![1, 2]));
        assert_eq!(resp.status, ErrorCode::Ok);
        assert_eq!(resp.objects[0].nid, USER_NID_START);
        assert_eq!(sim.block(USER_NID_START), Some((301, vec![1, 2])));
    }

    #[test]
    fn system_blocks_cannot_be_deleted() {
        let sim = SimHandle::new();
        let mut transport = SimTransport::connect(&sim);
        let resp = roundtrip(&mut transport, Command::delete(2));
        assert_eq!(resp.status, ErrorCode::BlockNotDeletable);
        let resp = roundtrip(&mut transport, Command::delete(555));
        assert_eq!(resp.status, ErrorCode::InvalidBlockId);
    }

    #[test]
    fn write_checks_type() {
        let sim = SimHandle::new();
        let mut transport = SimTransport::connect(&sim);
        let resp = roundtrip(&mut transport, Command::write(3, 302, vec![0]));
        assert_eq!(resp.status, ErrorCode::InvalidBlockType);
    }

    #[test]
    fn names_follow_blocks() {
        let sim = SimHandle::new();
        sim.insert_block(120, 301, vec![]);
        let mut transport = SimTransport::connect(&sim);
        let resp = roundtrip(&mut transport, Command::write_name(120, "fridge"));
        assert_eq!(resp.status, ErrorCode::Ok);
        assert_eq!(sim.name(120).as_deref(), Some("fridge"));

        roundtrip(&mut transport, Command::new(Opcode::ClearBlocks));
        assert_eq!(sim.name(120), None);
        assert_eq!(sim.block(120), None);
        assert!(sim.block(2).is_some());
    }

    #[test]
    fn latency_holds_replies() {
        let sim = SimHandle::new();
        sim.set_latency(2);
        let mut transport = SimTransport::connect(&sim);
        let mut buf = [0u8; 512];
        transport.read(&mut buf).unwrap();

        let frame = encode_frame(&Command::read(2).encode(), 4096).unwrap();
        transport.write(&frame).unwrap();
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
        assert_eq!(sim.max_outstanding(), 1);
        assert!(transport.read(&mut buf).unwrap() > 0);
    }

    #[test]
    fn disconnect_fails_next_read() {
        let sim = SimHandle::new();
        let mut transport = SimTransport::connect(&sim);
        sim.disconnect();
        let mut buf = [0u8; 8];
        assert!(transport.read(&mut buf).is_err());
    }
}
