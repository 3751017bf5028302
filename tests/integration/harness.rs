//! Shared rig: one Commander, Datastore and codec wired to a simulated
//! controller, driven on the test thread with `futures_lite::block_on`.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_lite::future;
use serde_json::Value;

use sparkhost::adapters::storage::MemoryStorage;
use sparkhost::adapters::time::FixedClock;
use sparkhost::app::blocks::BlockApi;
use sparkhost::app::events::EngineEvent;
use sparkhost::app::ports::EventSink;
use sparkhost::codec::{Fields, ObjectCodec};
use sparkhost::config::{ConnectionTarget, EngineConfig};
use sparkhost::datastore::Datastore;
use sparkhost::fsm::Epoch;
use sparkhost::rpc::commander::{CommandPolicy, Commander, SessionEnd};
use sparkhost::rpc::sim::{SimHandle, SimTransport};
use sparkhost::sync::{SyncReport, Synchronizer};

pub const NOW: u64 = 1_700_000_000;

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        target: ConnectionTarget::Simulation,
        command_timeout_ms: 40,
        retry_limit: 2,
        handshake_ping_ms: 20,
        handshake_timeout_ms: 400,
        reconnect_base_ms: 10,
        reconnect_max_ms: 40,
        max_connect_attempts: 3,
        broadcast_interval_ms: 0,
        ..EngineConfig::default()
    }
}

pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

// ── Rig ───────────────────────────────────────────────────────

pub struct Rig {
    pub sim: SimHandle,
    pub storage: MemoryStorage,
    pub config: EngineConfig,
    pub commander: Commander,
    pub datastore: Datastore<MemoryStorage>,
    pub codec: ObjectCodec,
    pub clock: FixedClock,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let storage = MemoryStorage::new();
        Self {
            sim: SimHandle::new(),
            datastore: Datastore::open(storage.clone()).unwrap(),
            storage,
            commander: Commander::new(CommandPolicy::from_config(&config)),
            codec: ObjectCodec::standard().unwrap(),
            clock: FixedClock(NOW),
            config,
        }
    }

    pub fn synchronizer(&self) -> Synchronizer<'_, MemoryStorage> {
        Synchronizer::new(
            &self.commander,
            &self.datastore,
            &self.codec,
            &self.clock,
            &self.config,
        )
    }

    pub fn blocks(&self) -> BlockApi<'_, MemoryStorage> {
        BlockApi::new(&self.commander, &self.datastore, &self.codec)
    }

    /// Open a session with the simulator and run `body` while it is live.
    /// `Err` carries the reason when the session ended first.
    pub fn session<F, Fut, T>(&self, body: F) -> Result<T, SessionEnd>
    where
        F: FnOnce(Epoch) -> Fut,
        Fut: Future<Output = T>,
    {
        self.commander.begin_connecting().unwrap();
        let epoch = self.commander.open_session().unwrap();
        let transport = SimTransport::connect(&self.sim);
        let result = future::block_on(future::or(
            async { Err(self.commander.run_session(epoch, transport).await) },
            async { Ok(body(epoch).await) },
        ));
        self.commander.connection_lost(epoch);
        result
    }

    /// Open a session, synchronize it, then run `body` in `Ready`.
    pub fn ready<F, Fut, T>(&self, body: F) -> T
    where
        F: FnOnce(SyncReport) -> Fut,
        Fut: Future<Output = T>,
    {
        self.session(|epoch| async move {
            let report = self.synchronizer().run(epoch).await.expect("sync failed");
            body(report).await
        })
        .expect("session ended early")
    }
}

// ── Recording sink ────────────────────────────────────────────

/// Clones share one event list.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
