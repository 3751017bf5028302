//! Broadcaster snapshots through the event sink.

use std::sync::Mutex;
use std::time::Duration;

use async_io_mini::Timer;
use futures_lite::future;
use serde_json::json;

use sparkhost::app::events::EngineEvent;
use sparkhost::broadcast::Broadcaster;

use crate::harness::{RecordingSink, Rig, fields};

fn snapshots(sink: &RecordingSink) -> Vec<sparkhost::Snapshot> {
    sink.events()
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::Snapshot(snapshot) => Some(snapshot),
            _ => None,
        })
        .collect()
}

#[test]
fn tick_publishes_resolved_blocks() {
    let rig = &Rig::new();
    let sink = RecordingSink::new();
    let shared = Mutex::new(sink.clone());

    let published = rig.ready(|report| async move {
        rig.blocks()
            .create("mash", "TempSensorMock", fields(json!({"value": 66.0})))
            .await
            .unwrap();
        let data = rig.codec.encode(301, &fields(json!({}))).unwrap();
        rig.sim.insert_block(140, 301, data);

        let broadcaster = Broadcaster::new(&rig.commander, &rig.datastore, &rig.codec, &shared);
        (broadcaster.tick().await, report.epoch)
    });

    let (ok, epoch) = published;
    assert!(ok);
    let snapshots = snapshots(&sink);
    assert_eq!(snapshots.len(), 1);
    let snapshot = &snapshots[0];
    assert_eq!(snapshot.epoch, epoch);
    assert_eq!(snapshot.blocks["mash"].data["value"], json!(66.0));
    assert!(snapshot.blocks.contains_key("New|TempSensorMock-1"));

    let history = snapshot.history();
    assert!(history.contains_key("mash"));
    assert!(!history.contains_key("New|TempSensorMock-1"));
}

#[test]
fn undecodable_block_does_not_sink_the_snapshot() {
    let rig = &Rig::new();
    let sink = RecordingSink::new();
    let shared = Mutex::new(sink.clone());

    rig.ready(|_| async move {
        rig.sim.insert_block(130, 301, Vec::new());
        let broadcaster = Broadcaster::new(&rig.commander, &rig.datastore, &rig.codec, &shared);
        assert!(broadcaster.tick().await);
    });

    let snapshots = snapshots(&sink);
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].blocks.contains_key("SystemInfo"));
    assert!(snapshots[0].blocks.values().all(|block| block.nid != 130));
}

#[test]
fn nothing_is_published_until_ready() {
    let rig = &Rig::new();
    let sink = RecordingSink::new();
    let shared = Mutex::new(sink.clone());
    let broadcaster = Broadcaster::new(&rig.commander, &rig.datastore, &rig.codec, &shared);

    assert!(!future::block_on(broadcaster.tick()));
    let during_sync = rig
        .session(|_| async { broadcaster.tick().await })
        .unwrap();
    assert!(!during_sync);
    assert!(sink.events().is_empty());
}

#[test]
fn run_ticks_on_the_interval() {
    let rig = &Rig::new();
    let sink = RecordingSink::new();
    let shared = Mutex::new(sink.clone());

    rig.ready(|_| async move {
        let broadcaster = Broadcaster::new(&rig.commander, &rig.datastore, &rig.codec, &shared);
        future::or(broadcaster.run(Duration::from_millis(20)), async {
            Timer::after(Duration::from_millis(150)).await;
        })
        .await;
    });

    assert!(snapshots(&sink).len() >= 2);
}
