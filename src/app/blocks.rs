//! Block operations for the REST layer.
//!
//! Every operation is a Commander submission plus Datastore lookups; no
//! block state is kept here.  Link fields travel as numeric ids on the wire
//! and as stable ids outside the engine (numeric `0` ⇄ `null`).

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde_json::Value;

use super::events::Block;
use super::ports::StoragePort;
use crate::codec::{Fields, ObjectCodec};
use crate::datastore::{Datastore, validate_sid};
use crate::error::{CommandError, Result, StoreError};
use crate::rpc::command::{Command, EncodedObject, Opcode, Response};
use crate::rpc::commander::Commander;

// ── Link translation ─────────────────────────────────────────

fn links_to_sids<S: StoragePort>(
    codec: &ObjectCodec,
    datastore: &Datastore<S>,
    type_id: u16,
    fields: &mut Fields,
) {
    for name in codec.link_fields(type_id) {
        let Some(value) = fields.get_mut(*name) else {
            continue;
        };
        let nid = value.as_u64().and_then(|n| u16::try_from(n).ok());
        *value = match nid {
            Some(0) | None => Value::Null,
            Some(nid) => match datastore.resolve_nid(nid) {
                Ok(sid) => Value::String(sid),
                Err(_) => {
                    debug!("Blocks: link {} to unknown #{}", name, nid);
                    Value::Null
                }
            },
        };
    }
}

fn links_to_nids<S: StoragePort>(
    codec: &ObjectCodec,
    datastore: &Datastore<S>,
    type_id: u16,
    fields: &mut Fields,
) -> Result<()> {
    for name in codec.link_fields(type_id) {
        let Some(value) = fields.get_mut(*name) else {
            continue;
        };
        let nid = match value {
            Value::Null => 0,
            Value::String(sid) => datastore.resolve_sid(sid)?,
            _ => continue,
        };
        *value = Value::from(nid);
    }
    Ok(())
}

/// Present one wire object as a [`Block`], inventing an id if needed.
pub(crate) fn to_block<S: StoragePort>(
    codec: &ObjectCodec,
    datastore: &Datastore<S>,
    obj: &EncodedObject,
) -> Result<Block> {
    let mut data = codec.decode(obj.type_id, &obj.data)?;
    let type_name = codec.type_name(obj.type_id).unwrap_or("Unknown");
    let id = match datastore.resolve_nid(obj.nid) {
        Ok(sid) => sid,
        Err(_) => datastore.allocate(obj.nid, type_name)?,
    };
    links_to_sids(codec, datastore, obj.type_id, &mut data);
    Ok(Block {
        id,
        nid: obj.nid,
        type_name: type_name.to_string(),
        data,
    })
}

/// Present every object of a listing.  Objects that fail are logged and left
/// out; they never sink the whole listing.
pub(crate) fn to_blocks<S: StoragePort>(
    codec: &ObjectCodec,
    datastore: &Datastore<S>,
    objects: &[EncodedObject],
) -> BTreeMap<String, Block> {
    let mut blocks = BTreeMap::new();
    for obj in objects {
        match to_block(codec, datastore, obj) {
            Ok(block) => {
                blocks.insert(block.id.clone(), block);
            }
            Err(e) => warn!("Blocks: skipping #{} (type {}): {}", obj.nid, obj.type_id, e),
        }
    }
    blocks
}

fn first_object(response: Response) -> Result<EncodedObject> {
    response
        .objects
        .into_iter()
        .next()
        .ok_or_else(|| CommandError::Malformed("response carries no object").into())
}

// ── API ──────────────────────────────────────────────────────

pub struct BlockApi<'a, S: StoragePort> {
    commander: &'a Commander,
    datastore: &'a Datastore<S>,
    codec: &'a ObjectCodec,
}

impl<'a, S: StoragePort> BlockApi<'a, S> {
    pub fn new(
        commander: &'a Commander,
        datastore: &'a Datastore<S>,
        codec: &'a ObjectCodec,
    ) -> Self {
        Self {
            commander,
            datastore,
            codec,
        }
    }

    pub async fn read(&self, sid: &str) -> Result<Block> {
        let nid = self.datastore.resolve_sid(sid)?;
        let response = self.commander.submit(Command::read(nid)).await?;
        to_block(self.codec, self.datastore, &first_object(response)?)
    }

    /// All blocks on the controller, keyed by stable id.
    pub async fn read_all(&self) -> Result<BTreeMap<String, Block>> {
        let response = self.commander.submit(Command::read_all()).await?;
        Ok(to_blocks(self.codec, self.datastore, &response.objects))
    }

    pub async fn create(&self, sid: &str, type_name: &str, mut fields: Fields) -> Result<Block> {
        validate_sid(sid)?;
        if self.datastore.resolve_sid(sid).is_ok() {
            return Err(StoreError::Conflict(sid.to_string()).into());
        }
        let type_id = self.codec.type_id(type_name)?;
        links_to_nids(self.codec, self.datastore, type_id, &mut fields)?;
        let data = self.codec.encode(type_id, &fields)?;

        let response = self.commander.submit(Command::create(type_id, data)).await?;
        let created = first_object(response)?;
        self.datastore.assign(sid, created.nid)?;
        self.store_token(created.nid, sid).await;
        info!("Blocks: created '{}' as #{}", sid, created.nid);
        to_block(self.codec, self.datastore, &created)
    }

    pub async fn write(&self, sid: &str, type_name: &str, mut fields: Fields) -> Result<Block> {
        let nid = self.datastore.resolve_sid(sid)?;
        let type_id = self.codec.type_id(type_name)?;
        links_to_nids(self.codec, self.datastore, type_id, &mut fields)?;
        let data = self.codec.encode(type_id, &fields)?;

        let response = self
            .commander
            .submit(Command::write(nid, type_id, data))
            .await?;
        to_block(self.codec, self.datastore, &first_object(response)?)
    }

    /// Delete on the controller, then drop the identity record.
    pub async fn delete(&self, sid: &str) -> Result<()> {
        let nid = self.datastore.resolve_sid(sid)?;
        self.commander.submit(Command::delete(nid)).await?;
        self.datastore.remove(sid)?;
        info!("Blocks: deleted '{}' (#{})", sid, nid);
        Ok(())
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.datastore.rename(old, new)?;
        if let Ok(nid) = self.datastore.resolve_sid(new) {
            self.store_token(nid, new).await;
        }
        info!("Blocks: renamed '{}' to '{}'", old, new);
        Ok(())
    }

    /// Name every controller block the datastore does not know yet.
    /// Returns the ids allocated.
    pub async fn discover(&self) -> Result<Vec<String>> {
        let response = self
            .commander
            .submit(Command::new(Opcode::BlockDiscover))
            .await?;
        let mut allocated = Vec::new();
        for obj in &response.objects {
            if self.datastore.resolve_nid(obj.nid).is_err() {
                let type_name = self.codec.type_name(obj.type_id).unwrap_or("Unknown");
                allocated.push(self.datastore.allocate(obj.nid, type_name)?);
            }
        }
        Ok(allocated)
    }

    /// Keep a copy of the stable id on the controller.  Best effort: the
    /// datastore stays authoritative.
    async fn store_token(&self, nid: u16, sid: &str) {
        if let Err(e) = self.commander.submit(Command::write_name(nid, sid)).await {
            warn!("Blocks: id token for #{} not stored: {}", nid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::storage::MemoryStorage;
    use serde_json::json;

    fn fixture() -> (ObjectCodec, Datastore<MemoryStorage>) {
        (
            ObjectCodec::standard().unwrap(),
            Datastore::open(MemoryStorage::new()).unwrap(),
        )
    }

    const SETPOINT_PAIR: u16 = 303;

    #[test]
    fn links_round_trip_through_stable_ids() {
        let (codec, store) = fixture();
        store.assign("fridge-sensor", 101).unwrap();

        let mut fields = Fields::new();
        fields.insert("sensorId".into(), json!("fridge-sensor"));
        links_to_nids(&codec, &store, SETPOINT_PAIR, &mut fields).unwrap();
        assert_eq!(fields["sensorId"], json!(101));

        links_to_sids(&codec, &store, SETPOINT_PAIR, &mut fields);
        assert_eq!(fields["sensorId"], json!("fridge-sensor"));
    }

    #[test]
    fn zero_link_is_null() {
        let (codec, store) = fixture();
        let mut fields = Fields::new();
        fields.insert("sensorId".into(), Value::Null);
        links_to_nids(&codec, &store, SETPOINT_PAIR, &mut fields).unwrap();
        assert_eq!(fields["sensorId"], json!(0));
        links_to_sids(&codec, &store, SETPOINT_PAIR, &mut fields);
        assert_eq!(fields["sensorId"], Value::Null);
    }

    #[test]
    fn unknown_link_target_rejected_on_write() {
        let (codec, store) = fixture();
        let mut fields = Fields::new();
        fields.insert("sensorId".into(), json!("nowhere"));
        let err = links_to_nids(&codec, &store, SETPOINT_PAIR, &mut fields).unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn listing_skips_undecodable_objects() {
        let (codec, store) = fixture();
        let good = codec
            .encode(301, json!({"value": 4.5}).as_object().unwrap())
            .unwrap();
        let objects = vec![
            EncodedObject::new(100, 301, good.clone()),
            EncodedObject::new(101, 301, vec![]),
            EncodedObject::new(102, 301, good),
        ];
        let blocks = to_blocks(&codec, &store, &objects);
        assert_eq!(blocks.len(), 2);
        assert!(blocks.contains_key("New|TempSensorMock-1"));
        assert!(blocks.contains_key("New|TempSensorMock-2"));
    }
}
