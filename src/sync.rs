//! Per-connection synchronization.
//!
//! Runs once for every new epoch, strictly in order; any failing step aborts
//! the connection attempt:
//!
//! ```text
//!   handshake ──▶ compatibility ──▶ clock set ──▶ identity reconciliation ──▶ Ready
//!   (Version ping                    (Ticks @ 3)   (discover + name tokens)
//!    until welcome)
//! ```
//!
//! Reconciliation never deletes records: ids known to the datastore but
//! missing on the controller keep their record and simply stop resolving
//! once another block claims the numeric id.

use std::collections::BTreeMap;
use std::time::Duration;

use async_io_mini::Timer;
use futures_lite::future;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::app::ports::{ClockPort, StoragePort};
use crate::codec::blocks::{BlockData, Ticks};
use crate::codec::{Fields, ObjectCodec};
use crate::config::EngineConfig;
use crate::datastore::{Datastore, system_object_id, validate_sid};
use crate::error::{CommandError, Result, SyncError};
use crate::fsm::Epoch;
use crate::rpc::command::{Command, ErrorCode, Opcode};
use crate::rpc::commander::Commander;
use crate::rpc::handshake::{Handshake, truncate_version};

/// Numeric id of the controller clock block.
pub const SYSTEM_TIME_NID: u16 = 3;

/// Outcome of one synchronization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub epoch: Epoch,
    pub handshake: Handshake,
    /// Ids whose numeric id from an earlier epoch still matched.
    pub matched: Vec<String>,
    /// Ids recovered from tokens stored on the controller.
    pub named: Vec<String>,
    /// Ids invented for blocks nobody named.
    pub allocated: Vec<String>,
    /// Known ids the controller no longer holds; kept, but unresolvable.
    pub released: Vec<String>,
}

pub struct Synchronizer<'a, S: StoragePort> {
    commander: &'a Commander,
    datastore: &'a Datastore<S>,
    codec: &'a ObjectCodec,
    clock: &'a dyn ClockPort,
    config: &'a EngineConfig,
}

impl<'a, S: StoragePort> Synchronizer<'a, S> {
    pub fn new(
        commander: &'a Commander,
        datastore: &'a Datastore<S>,
        codec: &'a ObjectCodec,
        clock: &'a dyn ClockPort,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            commander,
            datastore,
            codec,
            clock,
            config,
        }
    }

    /// Synchronize `epoch`, then move the Commander to `Ready`.
    pub async fn run(&self, epoch: Epoch) -> Result<SyncReport> {
        info!("Sync: starting for epoch {}", epoch);
        self.datastore.begin_epoch(epoch);

        let handshake = self.handshake().await?;
        self.check_compatibility(&handshake)?;
        self.set_clock().await?;
        let mut report = self.reconcile(epoch, handshake).await?;
        self.commander.mark_ready(epoch)?;

        report.allocated.sort();
        info!(
            "Sync: epoch {} ready ({} matched, {} named, {} allocated)",
            epoch,
            report.matched.len(),
            report.named.len(),
            report.allocated.len()
        );
        Ok(report)
    }

    // ── Step 1: handshake + compatibility ────────────────────

    async fn handshake(&self) -> Result<Handshake> {
        let ping = self.config.handshake_ping();
        let wait = async {
            loop {
                if let Some(handshake) = self.commander.handshake() {
                    return handshake;
                }
                let prompt = async {
                    let version = Command::new(Opcode::Version);
                    if let Err(e) = self.commander.submit_internal(version, Some(ping)).await {
                        debug!("Sync: version prompt: {}", e);
                    }
                    Timer::after(ping).await;
                };
                future::or(prompt, self.commander.handshake_seen()).await;
            }
        };
        let deadline = self.config.handshake_timeout();
        future::or(async { Some(wait.await) }, expire(deadline))
            .await
            .ok_or_else(|| {
                warn!("Sync: no handshake within {:?}", deadline);
                SyncError::HandshakeTimeout.into()
            })
    }

    fn check_compatibility(&self, handshake: &Handshake) -> core::result::Result<(), SyncError> {
        let expected = truncate_version(&self.config.proto_version);
        if self.config.skip_version_check {
            debug!("Sync: version check skipped");
        } else if handshake.short_proto_version() != expected {
            warn!(
                "Sync: controller protocol {} does not match {}",
                handshake.proto_version, expected
            );
            return Err(SyncError::IncompatibleFirmware {
                expected: expected.to_string(),
                actual: handshake.proto_version.clone(),
            });
        }

        if let Some(expected) = &self.config.device_id {
            if !expected.eq_ignore_ascii_case(&handshake.device_id) {
                return Err(SyncError::InvalidDeviceId {
                    expected: expected.clone(),
                    actual: handshake.device_id.clone(),
                });
            }
        }
        Ok(())
    }

    // ── Step 2: clock ────────────────────────────────────────

    async fn set_clock(&self) -> Result<()> {
        let now = self.clock.now_secs();
        let mut fields = Fields::new();
        fields.insert(
            "secondsSinceEpoch".into(),
            json!(u32::try_from(now).unwrap_or(u32::MAX)),
        );
        let data = self.codec.encode(Ticks::TYPE_ID, &fields)?;
        let write = Command::write(SYSTEM_TIME_NID, Ticks::TYPE_ID, data);
        match self.commander.submit_internal(write, None).await {
            Ok(_) => {
                debug!("Sync: controller clock set to {}", now);
                Ok(())
            }
            // no clock block at the well-known id
            Err(CommandError::Rejected {
                code: code @ (ErrorCode::InvalidBlockId | ErrorCode::InvalidBlockType),
                ..
            }) => {
                warn!("Sync: controller clock not set ({})", code);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Step 3: identities ───────────────────────────────────

    async fn name_tokens(&self) -> Result<BTreeMap<u16, String>> {
        let request = Command::new(Opcode::NameReadAll);
        match self.commander.submit_internal(request, None).await {
            Ok(response) => Ok(response
                .objects
                .iter()
                .filter_map(|obj| obj.name().map(|name| (obj.nid, name.to_string())))
                .filter(|(_, name)| validate_sid(name).is_ok())
                .collect()),
            Err(CommandError::Rejected { code, .. }) => {
                info!("Sync: controller keeps no id tokens ({})", code);
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile(&self, epoch: Epoch, handshake: Handshake) -> Result<SyncReport> {
        let discovered = self
            .commander
            .submit_internal(Command::new(Opcode::BlockDiscover), None)
            .await?
            .objects;
        let tokens = self.name_tokens().await?;

        let mut report = SyncReport {
            epoch,
            handshake,
            matched: Vec::new(),
            named: Vec::new(),
            allocated: Vec::new(),
            released: Vec::new(),
        };
        for obj in discovered {
            if let Ok(sid) = self.datastore.resolve_nid(obj.nid) {
                self.datastore.assign(&sid, obj.nid)?;
                report.matched.push(sid);
            } else if let Some(token) = tokens.get(&obj.nid) {
                self.datastore.assign(token, obj.nid)?;
                report.named.push(token.clone());
            } else if let Some(sid) = system_object_id(obj.nid, obj.type_id) {
                self.datastore.assign(sid, obj.nid)?;
                report.named.push(sid.to_string());
            } else {
                let type_name = self.codec.type_name(obj.type_id).unwrap_or("Unknown");
                report
                    .allocated
                    .push(self.datastore.allocate(obj.nid, type_name)?);
            }
        }
        report.released = self.datastore.release_unseen()?;
        Ok(report)
    }
}

async fn expire<T>(after: Duration) -> Option<T> {
    Timer::after(after).await;
    None
}
