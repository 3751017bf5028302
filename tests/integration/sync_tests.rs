//! Synchronization against the simulated controller.

use std::io;

use futures_lite::future;
use serde_json::json;

use sparkhost::codec::blocks::{BlockData, DigitalActuator, TempSensorMock, Ticks};
use sparkhost::datastore::Datastore;
use sparkhost::error::{Error, SyncError};
use sparkhost::fsm::ConnectionState;
use sparkhost::rpc::transport::Transport;

use crate::harness::{NOW, Rig, fast_config, fields};

fn mock_sensor(rig: &Rig, value: f64) -> Vec<u8> {
    rig.codec
        .encode(TempSensorMock::TYPE_ID, &fields(json!({ "value": value })))
        .unwrap()
}

// ── Happy path ───────────────────────────────────────────────

#[test]
fn fresh_controller_names_system_objects_and_sets_clock() {
    let rig = &Rig::new();
    let report = rig.ready(|report| async move { report });

    assert_eq!(rig.commander.state(), ConnectionState::Ready);
    for sid in [
        "ActiveGroups",
        "SystemInfo",
        "SystemTime",
        "OneWireBus",
        "DisplaySettings",
    ] {
        assert!(report.named.iter().any(|n| n == sid), "{sid} not named");
    }
    assert!(report.allocated.is_empty());
    assert_eq!(report.handshake.device_id, rig.sim.handshake().device_id);

    let (type_id, data) = rig.sim.block(3).unwrap();
    assert_eq!(type_id, Ticks::TYPE_ID);
    let ticks = rig.codec.decode(type_id, &data).unwrap();
    assert_eq!(ticks["secondsSinceEpoch"], json!(NOW));
}

#[test]
fn known_block_matched_and_stranger_allocated() {
    let rig = &Rig::new();
    for nid in [1, 2, 4, 7] {
        rig.sim.remove_block(nid);
    }
    rig.sim
        .insert_block(3, TempSensorMock::TYPE_ID, mock_sensor(&rig, 20.5));
    let actuator = rig
        .codec
        .encode(DigitalActuator::TYPE_ID, &fields(json!({})))
        .unwrap();
    rig.sim.insert_block(5, DigitalActuator::TYPE_ID, actuator);
    rig.datastore.assign("fridge-sensor", 3).unwrap();

    let report = rig.ready(|report| async move { report });

    assert_eq!(report.matched, vec!["fridge-sensor".to_string()]);
    assert_eq!(report.allocated, vec!["New|DigitalActuator-1".to_string()]);
    assert_eq!(rig.datastore.resolve_sid("fridge-sensor").unwrap(), 3);
    assert_eq!(
        rig.datastore.resolve_nid(5).unwrap(),
        "New|DigitalActuator-1"
    );
    // no clock block at 3: the sensor there is left alone
    assert_eq!(rig.sim.block(3).unwrap().0, TempSensorMock::TYPE_ID);
}

#[test]
fn id_tokens_on_the_controller_are_recovered() {
    let rig = &Rig::new();
    rig.sim
        .insert_block(120, TempSensorMock::TYPE_ID, mock_sensor(&rig, 64.0));
    rig.sim.set_name(120, "mash-temp");
    rig.sim
        .insert_block(121, TempSensorMock::TYPE_ID, mock_sensor(&rig, 4.0));
    rig.sim.set_name(121, "9-not-an-id");

    let report = rig.ready(|report| async move { report });

    assert!(report.named.contains(&"mash-temp".to_string()));
    assert_eq!(rig.datastore.resolve_sid("mash-temp").unwrap(), 120);
    assert_eq!(report.allocated, vec!["New|TempSensorMock-1".to_string()]);
}

#[test]
fn identities_survive_reconnect_and_restart() {
    let rig = &Rig::new();
    rig.sim
        .insert_block(110, TempSensorMock::TYPE_ID, mock_sensor(&rig, 70.0));

    let first = rig.ready(|report| async move { report });
    assert_eq!(first.allocated, vec!["New|TempSensorMock-1".to_string()]);
    rig.datastore
        .rename("New|TempSensorMock-1", "kettle")
        .unwrap();

    let second = rig.ready(|report| async move { report });
    assert!(second.epoch > first.epoch);
    assert!(second.matched.contains(&"kettle".to_string()));
    assert!(second.allocated.is_empty());

    let reopened = Datastore::open(rig.storage.clone()).unwrap();
    assert_eq!(reopened.resolve_sid("kettle").unwrap(), 110);
}

#[test]
fn vanished_block_keeps_its_record_but_stops_resolving() {
    let rig = &Rig::new();
    rig.sim
        .insert_block(110, TempSensorMock::TYPE_ID, mock_sensor(&rig, 70.0));
    rig.sim.set_name(110, "kettle");
    let first = rig.ready(|report| async move { report });
    assert!(first.named.contains(&"kettle".to_string()));
    assert!(first.released.is_empty());

    rig.sim.remove_block(110);
    let (second, requests) = rig.ready(|report| async move {
        let before = rig.sim.requests();
        let err = rig.blocks().read("kettle").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
        (report, rig.sim.requests() - before)
    });

    assert_eq!(second.released, vec!["kettle".to_string()]);
    assert_eq!(requests, 0);
    assert!(rig.datastore.resolve_sid("kettle").is_err());
    assert!(rig.datastore.resolve_nid(110).is_err());
    let record = rig.datastore.record("kettle").unwrap();
    assert_eq!((record.nid, record.last_seen), (None, first.epoch));

    rig.sim
        .insert_block(130, TempSensorMock::TYPE_ID, mock_sensor(&rig, 71.0));
    rig.sim.set_name(130, "kettle");
    let third = rig.ready(|report| async move { report });
    assert!(third.named.contains(&"kettle".to_string()));
    assert_eq!(rig.datastore.resolve_sid("kettle").unwrap(), 130);
}

// ── Refusals ─────────────────────────────────────────────────

#[test]
fn incompatible_firmware_is_refused() {
    let rig = &Rig::new();
    rig.sim.set_proto_version("deadbeef");

    let result = rig
        .session(|epoch| async move { rig.synchronizer().run(epoch).await })
        .unwrap();

    assert_eq!(
        result.unwrap_err(),
        Error::Sync(SyncError::IncompatibleFirmware {
            expected: "3f2243a".into(),
            actual: "deadbeef".into(),
        })
    );
    assert_ne!(rig.commander.state(), ConnectionState::Ready);
}

#[test]
fn version_check_can_be_skipped() {
    let rig = &Rig::with_config(sparkhost::EngineConfig {
        skip_version_check: true,
        ..fast_config()
    });
    rig.sim.set_proto_version("deadbeef");
    let report = rig.ready(|report| async move { report });
    assert_eq!(report.handshake.proto_version, "deadbeef");
}

#[test]
fn unexpected_device_is_refused() {
    let rig = &Rig::with_config(sparkhost::EngineConfig {
        device_id: Some("AABBCCDDEEFF".into()),
        ..fast_config()
    });
    let result = rig
        .session(|epoch| async move { rig.synchronizer().run(epoch).await })
        .unwrap();
    assert!(matches!(
        result,
        Err(Error::Sync(SyncError::InvalidDeviceId { .. }))
    ));
}

#[test]
fn expected_device_id_ignores_case() {
    let rig = &Rig::with_config(sparkhost::EngineConfig {
        device_id: Some("5A1D0C0FFEE5".into()),
        ..fast_config()
    });
    rig.ready(|_| async {});
    assert_eq!(rig.commander.state(), ConnectionState::Ready);
}

/// Accepts everything, says nothing.
struct SilentTransport;

impl Transport for SilentTransport {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn silent_controller_times_out_the_handshake() {
    let rig = &Rig::new();
    rig.commander.begin_connecting().unwrap();
    let epoch = rig.commander.open_session().unwrap();

    let result = future::block_on(future::or(
        async {
            rig.commander.run_session(epoch, SilentTransport).await;
            future::pending().await
        },
        rig.synchronizer().run(epoch),
    ));

    assert_eq!(result.unwrap_err(), Error::Sync(SyncError::HandshakeTimeout));
    assert!(rig.commander.handshake().is_none());
}
