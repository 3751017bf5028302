//! Identity datastore.
//!
//! Maps the stable, user-facing id of every known block to the numeric id
//! the controller assigned it during the current boot.  Both lookup
//! directions are views of one record set:
//!
//! ```text
//!   by_sid: "fridge-sensor" ──▶ IdentityRecord { nid: Some(3), last_seen: 7 }
//!   by_nid:              3  ──▶ "fridge-sensor"
//! ```
//!
//! Every mutation is applied to a staged copy, persisted as a whole
//! snapshot through the [`StoragePort`], and only then swapped in.  A
//! failed write leaves the in-memory views untouched, and the storage
//! adapter's atomic replace means a crash leaves either the old snapshot
//! or the new one on disk.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{StorageError, StoragePort};
use crate::error::StoreError;
use crate::fsm::Epoch;

/// Prefix of ids invented for blocks nobody named.
pub const GENERATED_ID_PREFIX: &str = "New|";

/// First numeric id the controller hands out to user blocks.
pub const USER_NID_START: u16 = 100;

/// Fixed system objects present on every controller: (id, numeric id, type id).
pub const SYSTEM_OBJECTS: &[(&str, u16, u16)] = &[
    ("ActiveGroups", 1, 65534),
    ("SystemInfo", 2, 256),
    ("SystemTime", 3, 257),
    ("OneWireBus", 4, 258),
    ("WiFiSettings", 5, 312),
    ("TouchSettings", 6, 313),
    ("DisplaySettings", 7, 314),
];

/// Well-known id of a system object, if `nid` holds the expected type.
pub fn system_object_id(nid: u16, type_id: u16) -> Option<&'static str> {
    SYSTEM_OBJECTS
        .iter()
        .find(|(_, n, t)| *n == nid && *t == type_id)
        .map(|(sid, _, _)| *sid)
}

const NAMESPACE: &str = "datastore";
const SNAPSHOT_KEY: &str = "identities";
const DIGEST_LEN: usize = 32;
const MAX_ID_LEN: usize = 200;

/// One datastore entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub sid: String,
    /// Absent once another record claimed the numeric id, or once a
    /// synchronization no longer found it on the controller.
    pub nid: Option<u16>,
    pub last_seen: Epoch,
}

/// Check a user-supplied stable id.
pub fn validate_sid(sid: &str) -> Result<(), StoreError> {
    let valid = sid.chars().next().is_some_and(char::is_alphabetic)
        && sid.chars().count() <= MAX_ID_LEN
        && !sid.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(sid.to_string()))
    }
}

// ── Two-view index ───────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct Index {
    by_sid: BTreeMap<String, IdentityRecord>,
    by_nid: BTreeMap<u16, String>,
}

impl Index {
    fn from_records(records: Vec<IdentityRecord>) -> Self {
        let mut index = Self::default();
        for record in records {
            match record.nid {
                Some(nid) => index.upsert(&record.sid, nid, record.last_seen),
                None => {
                    index.by_sid.insert(record.sid.clone(), record);
                }
            }
        }
        index
    }

    fn records(&self) -> Vec<IdentityRecord> {
        self.by_sid.values().cloned().collect()
    }

    /// Bind `sid` to `nid`, displacing whichever record held `nid` before.
    fn upsert(&mut self, sid: &str, nid: u16, epoch: Epoch) {
        if let Some(holder) = self.by_nid.get(&nid).filter(|h| h.as_str() != sid) {
            if let Some(displaced) = self.by_sid.get_mut(holder) {
                debug!("Datastore: '{}' loses #{} to '{}'", displaced.sid, nid, sid);
                displaced.nid = None;
            }
        }
        if let Some(old) = self.by_sid.get(sid).and_then(|r| r.nid) {
            if old != nid {
                self.by_nid.remove(&old);
            }
        }
        self.by_sid.insert(
            sid.to_string(),
            IdentityRecord {
                sid: sid.to_string(),
                nid: Some(nid),
                last_seen: epoch,
            },
        );
        self.by_nid.insert(nid, sid.to_string());
    }

    /// Unbind every record not confirmed during `epoch`.
    fn release_unseen(&mut self, epoch: Epoch) -> Vec<String> {
        let mut released = Vec::new();
        for record in self.by_sid.values_mut() {
            let Some(nid) = record.nid.filter(|_| record.last_seen < epoch) else {
                continue;
            };
            record.nid = None;
            self.by_nid.remove(&nid);
            released.push(record.sid.clone());
        }
        released
    }

    fn remove(&mut self, sid: &str) -> Option<IdentityRecord> {
        let record = self.by_sid.remove(sid)?;
        if let Some(nid) = record.nid {
            self.by_nid.remove(&nid);
        }
        Some(record)
    }

    fn generate_sid(&self, type_name: &str) -> String {
        (1u64..)
            .map(|n| format!("{GENERATED_ID_PREFIX}{type_name}-{n}"))
            .find(|candidate| !self.by_sid.contains_key(candidate))
            .unwrap_or_default()
    }
}

// ── Persistence ──────────────────────────────────────────────

fn encode_snapshot(index: &Index) -> Result<Vec<u8>, StoreError> {
    let mut blob = postcard::to_allocvec(&index.records())
        .map_err(|_| StoreError::Storage(StorageError::IoError))?;
    let digest = hmac_sha256::Hash::hash(&blob);
    blob.extend_from_slice(&digest);
    Ok(blob)
}

fn decode_snapshot(blob: &[u8]) -> Result<Vec<IdentityRecord>, StoreError> {
    if blob.len() < DIGEST_LEN {
        return Err(StoreError::Corrupted);
    }
    let (body, digest) = blob.split_at(blob.len() - DIGEST_LEN);
    if hmac_sha256::Hash::hash(body) != digest {
        return Err(StoreError::Corrupted);
    }
    postcard::from_bytes(body).map_err(|_| StoreError::Corrupted)
}

// ── Datastore ────────────────────────────────────────────────

struct Inner<S> {
    storage: S,
    index: Index,
    epoch: Epoch,
}

pub struct Datastore<S: StoragePort> {
    inner: Mutex<Inner<S>>,
}

impl<S: StoragePort> Datastore<S> {
    /// Load the persisted snapshot, or start empty.
    pub fn open(storage: S) -> Result<Self, StoreError> {
        let records = match storage.read(NAMESPACE, SNAPSHOT_KEY) {
            Ok(blob) => decode_snapshot(&blob)?,
            Err(StorageError::NotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Datastore: loaded {} identity records", records.len());

        Ok(Self {
            inner: Mutex::new(Inner {
                storage,
                index: Index::from_records(records),
                epoch: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a staged copy, persist it, then commit.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Index, Epoch) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.lock();
        let mut staged = inner.index.clone();
        let out = f(&mut staged, inner.epoch)?;
        let blob = encode_snapshot(&staged)?;
        if let Err(e) = inner.storage.write(NAMESPACE, SNAPSHOT_KEY, &blob) {
            warn!("Datastore: persist failed: {}", e);
            return Err(e.into());
        }
        inner.index = staged;
        Ok(out)
    }

    /// Epoch stamped on records touched from now on.
    pub fn begin_epoch(&self, epoch: Epoch) {
        self.lock().epoch = epoch;
    }

    pub fn epoch(&self) -> Epoch {
        self.lock().epoch
    }

    /// Stable id → numeric id.
    pub fn resolve_sid(&self, sid: &str) -> Result<u16, StoreError> {
        self.lock()
            .index
            .by_sid
            .get(sid)
            .and_then(|r| r.nid)
            .ok_or_else(|| StoreError::NotFound(sid.to_string()))
    }

    /// Numeric id → stable id.
    pub fn resolve_nid(&self, nid: u16) -> Result<String, StoreError> {
        self.lock()
            .index
            .by_nid
            .get(&nid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("#{nid}")))
    }

    pub fn record(&self, sid: &str) -> Option<IdentityRecord> {
        self.lock().index.by_sid.get(sid).cloned()
    }

    pub fn records(&self) -> Vec<IdentityRecord> {
        self.lock().index.records()
    }

    /// Upsert: bind `sid` to `nid`, replacing any earlier binding of either.
    pub fn assign(&self, sid: &str, nid: u16) -> Result<(), StoreError> {
        validate_sid(sid)?;
        self.mutate(|index, epoch| {
            index.upsert(sid, nid, epoch);
            Ok(())
        })
    }

    /// Invent a stable id for a block nobody named, and bind it.
    pub fn allocate(&self, nid: u16, type_name: &str) -> Result<String, StoreError> {
        let sid = self.mutate(|index, epoch| {
            let sid = index.generate_sid(type_name);
            index.upsert(&sid, nid, epoch);
            Ok(sid)
        })?;
        info!("Datastore: allocated '{}' for #{}", sid, nid);
        Ok(sid)
    }

    /// Unbind records the current epoch has not confirmed.  The records
    /// stay, so a block that reappears under its token gets its id back.
    pub fn release_unseen(&self) -> Result<Vec<String>, StoreError> {
        let released = self.mutate(|index, epoch| Ok(index.release_unseen(epoch)))?;
        for sid in &released {
            info!("Datastore: '{}' is no longer on the controller", sid);
        }
        Ok(released)
    }

    /// Drop the record entirely.  Only explicit user deletion calls this.
    pub fn remove(&self, sid: &str) -> Result<IdentityRecord, StoreError> {
        self.mutate(|index, _| {
            index
                .remove(sid)
                .ok_or_else(|| StoreError::NotFound(sid.to_string()))
        })
    }

    /// Give a record a new stable id, keeping its numeric id.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), StoreError> {
        validate_sid(new)?;
        self.mutate(|index, epoch| {
            if index.by_sid.contains_key(new) {
                return Err(StoreError::Conflict(new.to_string()));
            }
            let record = index
                .remove(old)
                .ok_or_else(|| StoreError::NotFound(old.to_string()))?;
            match record.nid {
                Some(nid) => index.upsert(new, nid, epoch.max(record.last_seen)),
                None => {
                    index.by_sid.insert(
                        new.to_string(),
                        IdentityRecord {
                            sid: new.to_string(),
                            ..record
                        },
                    );
                }
            }
            Ok(())
        })
    }
}
