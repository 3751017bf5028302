//! Supervisor and engine runtime.
//!
//! The supervisor owns the transport lifecycle.  It is the only caller of
//! [`Commander::open_session`] (the epoch bump) and
//! [`Commander::connection_lost`], and it drives every state transition:
//!
//! ```text
//!   Disconnected ──connect──▶ Connecting ──open_session──▶ Synchronizing
//!        ▲                        │                             │ sync ok
//!        │      connect failed    │                             ▼
//!        └────────────────────────┴──────── lost / failed ◀── Ready
//!                 (backoff: base × 1.5ⁿ, capped)
//! ```
//!
//! While [`AutoConnect`] is off, the supervisor starts no new attempts.  A
//! live session is left running until it ends on its own.
//!
//! [`Engine::spawn`] runs the supervisor and the broadcaster on a dedicated
//! thread:
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │  Engine thread                                             │
//!  │  ┌──────────────────────────────────────────────────────┐  │
//!  │  │  futures_lite::block_on                              │  │
//!  │  │  ┌────────────────────────────────────────────────┐  │  │
//!  │  │  │  edge_executor::LocalExecutor                  │  │  │
//!  │  │  │  ┌─────────────────────┐  ┌─────────────────┐  │  │  │
//!  │  │  │  │ Supervisor          │  │ Broadcaster     │  │  │  │
//!  │  │  │  │ session + sync      │  │ interval ⏱      │  │  │  │
//!  │  │  │  └─────────────────────┘  └─────────────────┘  │  │  │
//!  │  │  └────────────────────────────────────────────────┘  │  │
//!  │  └──────────────────────────────────────────────────────┘  │
//!  └────────────────────────────────────────────────────────────┘
//! ```

use core::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{error, info, warn};

use crate::app::blocks::BlockApi;
use crate::app::events::EngineEvent;
use crate::app::ports::{ClockPort, EventSink, StoragePort};
use crate::broadcast::Broadcaster;
use crate::codec::ObjectCodec;
use crate::config::{EngineConfig, validate_config};
use crate::datastore::Datastore;
use crate::error::{Error, Result};
use crate::fsm::ConnectionState;
use crate::rpc::commander::{CommandPolicy, Commander};
use crate::rpc::transport::Connector;
use crate::sync::Synchronizer;

const BACKOFF_FACTOR: f64 = 1.5;
const MAX_BACKOFF_EXPONENT: u32 = 40;

type StopSignal = Signal<CriticalSectionRawMutex, ()>;

/// Switch that pauses and resumes reconnection.
pub struct AutoConnect {
    enabled: AtomicBool,
    changed: Signal<CriticalSectionRawMutex, ()>,
}

impl AutoConnect {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            changed: Signal::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            info!(
                "Supervisor: autoconnect {}",
                if enabled { "enabled" } else { "paused" }
            );
            self.changed.signal(());
        }
    }

    /// Resolve once reconnection is allowed.
    pub async fn enabled(&self) {
        while !self.is_enabled() {
            self.changed.wait().await;
        }
    }
}

/// Delay between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
            max_attempts: config.max_connect_attempts,
        }
    }

    /// Delay after `failures` consecutive failures (at least one).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let scaled = self.base.as_secs_f64() * BACKOFF_FACTOR.powi(exponent as i32);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

// ── Supervisor ───────────────────────────────────────────────

pub struct Supervisor<'a, S: StoragePort, E: EventSink, C: Connector> {
    commander: &'a Commander,
    datastore: &'a Datastore<S>,
    codec: &'a ObjectCodec,
    clock: &'a dyn ClockPort,
    sink: &'a Mutex<E>,
    config: &'a EngineConfig,
    autoconnect: &'a AutoConnect,
    connector: C,
}

impl<'a, S: StoragePort, E: EventSink, C: Connector> Supervisor<'a, S, E, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        commander: &'a Commander,
        datastore: &'a Datastore<S>,
        codec: &'a ObjectCodec,
        clock: &'a dyn ClockPort,
        sink: &'a Mutex<E>,
        config: &'a EngineConfig,
        autoconnect: &'a AutoConnect,
        connector: C,
    ) -> Self {
        Self {
            commander,
            datastore,
            codec,
            clock,
            sink,
            config,
            autoconnect,
            connector,
        }
    }

    fn emit(&self, event: EngineEvent) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .emit(&event);
    }

    fn transitioned(&self, from: ConnectionState, to: ConnectionState) {
        self.emit(EngineEvent::StateChanged {
            from,
            to,
            epoch: self.commander.epoch(),
        });
    }

    /// Reconnect until the attempt budget runs out.  Time spent paused
    /// does not count against it.
    pub async fn run(&mut self) -> Error {
        let policy = ReconnectPolicy::from_config(self.config);
        let mut failures = 0u32;
        loop {
            if !self.autoconnect.is_enabled() {
                self.autoconnect.enabled().await;
                failures = 0;
            }
            if self.attempt().await {
                failures = 0;
            } else {
                failures += 1;
            }
            if failures >= policy.max_attempts {
                error!("Supervisor: giving up after {} failed attempts", failures);
                return Error::RetriesExhausted(failures);
            }
            let delay = policy.delay(failures.max(1));
            info!("Supervisor: reconnecting in {:?}", delay);
            Timer::after(delay).await;
        }
    }

    /// One connection attempt, returning once it is over.  `true` when
    /// synchronization completed before the connection ended.
    pub async fn attempt(&mut self) -> bool {
        if let Err(e) = self.commander.begin_connecting() {
            warn!("Supervisor: {}", e);
            self.commander.disconnect();
            return false;
        }
        self.transitioned(ConnectionState::Disconnected, ConnectionState::Connecting);

        let transport = match self.connector.connect() {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Supervisor: connect failed: {}", e);
                self.commander.disconnect();
                self.transitioned(ConnectionState::Connecting, ConnectionState::Disconnected);
                return false;
            }
        };
        let epoch = match self.commander.open_session() {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!("Supervisor: {}", e);
                self.commander.disconnect();
                return false;
            }
        };
        self.transitioned(ConnectionState::Connecting, ConnectionState::Synchronizing);

        let synced = Cell::new(false);
        let sync = Synchronizer::new(
            self.commander,
            self.datastore,
            self.codec,
            self.clock,
            self.config,
        );
        let work = async {
            match sync.run(epoch).await {
                Ok(report) => {
                    synced.set(true);
                    self.transitioned(ConnectionState::Synchronizing, ConnectionState::Ready);
                    self.emit(EngineEvent::Synchronized {
                        epoch,
                        device_id: report.handshake.device_id,
                        allocated: report.allocated,
                    });
                    future::pending::<String>().await
                }
                Err(e) => {
                    warn!("Supervisor: synchronization failed: {}", e);
                    e.to_string()
                }
            }
        };
        let session = async { self.commander.run_session(epoch, transport).await.to_string() };
        let reason = future::or(session, work).await;

        let from = self.commander.state();
        self.commander.connection_lost(epoch);
        info!("Supervisor: epoch {} ended: {}", epoch, reason);
        self.emit(EngineEvent::ConnectionLost { epoch, reason });
        if from != ConnectionState::Disconnected {
            self.transitioned(from, ConnectionState::Disconnected);
        }
        synced.get()
    }
}

// ── Engine ───────────────────────────────────────────────────

/// Handle to a running engine thread.
pub struct Engine<S: StoragePort> {
    commander: Arc<Commander>,
    datastore: Arc<Datastore<S>>,
    codec: Arc<ObjectCodec>,
    autoconnect: Arc<AutoConnect>,
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl<S: StoragePort + Send + 'static> Engine<S> {
    /// Validate `config`, open the datastore and start the engine thread.
    pub fn spawn<C, E, K>(
        config: EngineConfig,
        connector: C,
        storage: S,
        sink: E,
        clock: K,
    ) -> Result<Self>
    where
        C: Connector + Send + 'static,
        E: EventSink + Send + 'static,
        K: ClockPort + Send + 'static,
    {
        validate_config(&config)?;
        let codec = Arc::new(ObjectCodec::standard()?);
        let datastore = Arc::new(Datastore::open(storage)?);
        let commander = Arc::new(Commander::new(CommandPolicy::from_config(&config)));
        let autoconnect = Arc::new(AutoConnect::new(true));
        let stop = Arc::new(StopSignal::new());

        let parts = (
            Arc::clone(&commander),
            Arc::clone(&datastore),
            Arc::clone(&codec),
            Arc::clone(&autoconnect),
            Arc::clone(&stop),
        );
        let thread = std::thread::Builder::new()
            .name("sparkhost-engine".into())
            .spawn(move || {
                let (commander, datastore, codec, autoconnect, stop) = parts;
                run_engine(
                    &commander,
                    &datastore,
                    &codec,
                    &autoconnect,
                    &stop,
                    config,
                    connector,
                    Mutex::new(sink),
                    clock,
                )
            })
            .map_err(|e| Error::Runtime(e.to_string()))?;

        Ok(Self {
            commander,
            datastore,
            codec,
            autoconnect,
            stop,
            thread: Some(thread),
        })
    }
}

impl<S: StoragePort> Engine<S> {
    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    pub fn datastore(&self) -> &Datastore<S> {
        &self.datastore
    }

    pub fn codec(&self) -> &ObjectCodec {
        &self.codec
    }

    pub fn blocks(&self) -> BlockApi<'_, S> {
        BlockApi::new(&self.commander, &self.datastore, &self.codec)
    }

    /// Pause or resume reconnection without stopping the engine.
    pub fn set_autoconnect(&self, enabled: bool) {
        self.autoconnect.set(enabled);
    }

    pub fn autoconnect(&self) -> bool {
        self.autoconnect.is_enabled()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the engine thread to finish on its own.
    pub fn join(mut self) -> Result<()> {
        self.join_thread()
    }

    /// Stop the engine and wait for its thread.
    pub fn stop(mut self) -> Result<()> {
        self.stop.signal(());
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(Error::Runtime("engine thread panicked".into()))),
            None => Ok(()),
        }
    }
}

impl<S: StoragePort> Drop for Engine<S> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop.signal(());
            if let Err(e) = self.join_thread() {
                warn!("Engine: {}", e);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_engine<S, E, C, K>(
    commander: &Commander,
    datastore: &Datastore<S>,
    codec: &ObjectCodec,
    autoconnect: &AutoConnect,
    stop: &StopSignal,
    config: EngineConfig,
    connector: C,
    sink: Mutex<E>,
    clock: K,
) -> Result<()>
where
    S: StoragePort,
    E: EventSink,
    C: Connector,
    K: ClockPort,
{
    let mut supervisor = Supervisor::new(
        commander,
        datastore,
        codec,
        &clock,
        &sink,
        &config,
        autoconnect,
        connector,
    );
    let broadcaster = Broadcaster::new(commander, datastore, codec, &sink);
    let executor: edge_executor::LocalExecutor<'_, 4> = edge_executor::LocalExecutor::new();

    if let Some(interval) = config.broadcast_interval() {
        executor
            .spawn(async move { broadcaster.run(interval).await })
            .detach();
    } else {
        info!("Engine: broadcasting disabled");
    }
    info!("Engine: started ({:?})", config.target);

    let outcome = future::block_on(executor.run(future::or(
        async { Err(supervisor.run().await) },
        async {
            stop.wait().await;
            Ok(())
        },
    )));
    commander.disconnect();
    info!("Engine: stopped");
    outcome
}
