//! Broadcaster: periodic resolved snapshot of every block.
//!
//! Each tick lists all objects, resolves them to [`Block`]s and publishes a
//! [`Snapshot`] through the event sink.  A failed tick is logged and skipped;
//! it is never retried before the next interval, since the data is live.
//!
//! [`Block`]: crate::app::events::Block

use std::sync::Mutex;
use std::time::Duration;

use async_io_mini::Timer;
use log::{debug, info, warn};

use crate::app::blocks::to_blocks;
use crate::app::events::{EngineEvent, Snapshot};
use crate::app::ports::{EventSink, StoragePort};
use crate::codec::ObjectCodec;
use crate::datastore::Datastore;
use crate::error::{CommandError, Result};
use crate::fsm::ConnectionState;
use crate::rpc::command::Command;
use crate::rpc::commander::Commander;

pub struct Broadcaster<'a, S: StoragePort, E: EventSink> {
    commander: &'a Commander,
    datastore: &'a Datastore<S>,
    codec: &'a ObjectCodec,
    sink: &'a Mutex<E>,
}

impl<'a, S: StoragePort, E: EventSink> Broadcaster<'a, S, E> {
    pub fn new(
        commander: &'a Commander,
        datastore: &'a Datastore<S>,
        codec: &'a ObjectCodec,
        sink: &'a Mutex<E>,
    ) -> Self {
        Self {
            commander,
            datastore,
            codec,
            sink,
        }
    }

    /// Collect one snapshot without publishing it.
    pub async fn collect(&self) -> Result<Snapshot> {
        let state = self.commander.state();
        if state != ConnectionState::Ready {
            return Err(CommandError::NotReady(state).into());
        }
        let epoch = self.commander.epoch();
        let response = self.commander.submit(Command::read_all()).await?;
        let blocks = to_blocks(self.codec, self.datastore, &response.objects);
        if blocks.len() < response.objects.len() {
            warn!(
                "Broadcast: {} of {} objects left out",
                response.objects.len() - blocks.len(),
                response.objects.len()
            );
        }
        Ok(Snapshot { epoch, blocks })
    }

    /// Run one tick.  Returns whether a snapshot was published.
    pub async fn tick(&self) -> bool {
        match self.collect().await {
            Ok(snapshot) => {
                debug!("Broadcast: {} blocks", snapshot.blocks.len());
                self.sink
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .emit(&EngineEvent::Snapshot(snapshot));
                true
            }
            Err(e) => {
                debug!("Broadcast: tick skipped: {}", e);
                false
            }
        }
    }

    /// Tick every `interval` forever.
    pub async fn run(&self, interval: Duration) {
        info!("Broadcast: every {:?}", interval);
        loop {
            Timer::after(interval).await;
            self.tick().await;
        }
    }
}
