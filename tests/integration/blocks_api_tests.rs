//! Block operations end to end: stable ids outside, numeric ids on the wire.

use serde_json::{Value, json};

use sparkhost::error::{CommandError, Error, ErrorKind};
use sparkhost::rpc::command::ErrorCode;

use crate::harness::{Rig, fields};

#[test]
fn created_block_reads_back_under_its_id() {
    let rig = &Rig::new();
    let (created, read) = rig.ready(|_| async move {
        let api = rig.blocks();
        let created = api
            .create("mash-sensor", "TempSensorMock", fields(json!({"value": 65.5})))
            .await
            .unwrap();
        let read = api.read("mash-sensor").await.unwrap();
        (created, read)
    });

    assert_eq!(created.id, "mash-sensor");
    assert!(created.nid >= 100);
    assert_eq!(read.type_name, "TempSensorMock");
    assert_eq!(read.data["value"], json!(65.5));
    assert_eq!(rig.datastore.resolve_sid("mash-sensor").unwrap(), created.nid);
    assert_eq!(rig.sim.name(created.nid).as_deref(), Some("mash-sensor"));
}

#[test]
fn taken_id_is_a_conflict() {
    let rig = &Rig::new();
    let requests_before_retry = rig.ready(|_| async move {
        let api = rig.blocks();
        api.create("kettle", "TempSensorMock", fields(json!({})))
            .await
            .unwrap();
        let before = rig.sim.requests();
        let err = api
            .create("kettle", "TempSensorMock", fields(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        rig.sim.requests() - before
    });
    assert_eq!(requests_before_retry, 0);
}

#[test]
fn links_travel_as_ids() {
    let rig = &Rig::new();
    let (setpoint, sensor_nid) = rig.ready(|_| async move {
        let api = rig.blocks();
        let sensor = api
            .create("ferment-sensor", "TempSensorMock", fields(json!({"value": 18.0})))
            .await
            .unwrap();
        let setpoint = api
            .create(
                "ferment-setpoint",
                "SetpointSensorPair",
                fields(json!({"sensorId": "ferment-sensor", "setting": 19.5})),
            )
            .await
            .unwrap();
        (setpoint, sensor.nid)
    });

    assert_eq!(setpoint.data["sensorId"], json!("ferment-sensor"));
    let (type_id, raw) = rig.sim.block(setpoint.nid).unwrap();
    let on_wire = rig.codec.decode(type_id, &raw).unwrap();
    assert_eq!(on_wire["sensorId"], json!(sensor_nid));
}

#[test]
fn empty_link_is_null() {
    let rig = &Rig::new();
    let setpoint = rig.ready(|_| async move {
        rig.blocks()
            .create(
                "idle-setpoint",
                "SetpointSensorPair",
                fields(json!({"sensorId": null})),
            )
            .await
            .unwrap()
    });
    assert_eq!(setpoint.data["sensorId"], Value::Null);
}

#[test]
fn unknown_link_target_is_not_found() {
    let rig = &Rig::new();
    let (err, requests) = rig.ready(|_| async move {
        let before = rig.sim.requests();
        let err = rig
            .blocks()
            .create(
                "orphan",
                "SetpointSensorPair",
                fields(json!({"sensorId": "nowhere"})),
            )
            .await
            .unwrap_err();
        (err, rig.sim.requests() - before)
    });
    assert_eq!(err.http_status(), 404);
    assert_eq!(requests, 0);
}

#[test]
fn write_with_wrong_type_is_rejected() {
    let rig = &Rig::new();
    let err = rig.ready(|_| async move {
        let api = rig.blocks();
        api.create("thermowell", "TempSensorMock", fields(json!({})))
            .await
            .unwrap();
        api.write("thermowell", "Pid", fields(json!({}))).await.unwrap_err()
    });
    assert!(matches!(
        err,
        Error::Command(CommandError::Rejected {
            code: ErrorCode::InvalidBlockType,
            ..
        })
    ));
}

#[test]
fn write_replaces_data() {
    let rig = &Rig::new();
    let written = rig.ready(|_| async move {
        let api = rig.blocks();
        api.create("thermowell", "TempSensorMock", fields(json!({"value": 1.0})))
            .await
            .unwrap();
        api.write(
            "thermowell",
            "TempSensorMock",
            fields(json!({"value": 2.0, "connected": true})),
        )
        .await
        .unwrap()
    });
    assert_eq!(written.data["value"], json!(2.0));
    assert_eq!(written.data["connected"], json!(true));
}

#[test]
fn delete_removes_block_and_identity() {
    let rig = &Rig::new();
    let nid = rig.ready(|_| async move {
        let api = rig.blocks();
        let created = api
            .create("spare", "TempSensorMock", fields(json!({})))
            .await
            .unwrap();
        api.delete("spare").await.unwrap();
        created.nid
    });
    assert!(rig.sim.block(nid).is_none());
    assert!(rig.datastore.resolve_sid("spare").is_err());
}

#[test]
fn system_blocks_cannot_be_deleted() {
    let rig = &Rig::new();
    let err = rig.ready(|_| async move { rig.blocks().delete("SystemInfo").await.unwrap_err() });
    assert!(matches!(
        err,
        Error::Command(CommandError::Rejected {
            code: ErrorCode::BlockNotDeletable,
            ..
        })
    ));
    assert_eq!(rig.datastore.resolve_sid("SystemInfo").unwrap(), 2);
}

#[test]
fn rename_moves_the_id_and_its_token() {
    let rig = &Rig::new();
    let read = rig.ready(|_| async move {
        let api = rig.blocks();
        api.create("hlt", "TempSensorMock", fields(json!({"value": 78.0})))
            .await
            .unwrap();
        api.rename("hlt", "hot-liquor").await.unwrap();
        assert_eq!(
            api.read("hlt").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        api.read("hot-liquor").await.unwrap()
    });
    assert_eq!(read.data["value"], json!(78.0));
    assert_eq!(rig.sim.name(read.nid).as_deref(), Some("hot-liquor"));
}

#[test]
fn listing_and_discovery_cover_new_blocks() {
    let rig = &Rig::new();
    let (listing, discovered) = rig.ready(|_| async move {
        let api = rig.blocks();
        api.create("boil", "TempSensorMock", fields(json!({})))
            .await
            .unwrap();
        let data = rig
            .codec
            .encode(301, &fields(json!({"value": 3.0})))
            .unwrap();
        rig.sim.insert_block(150, 301, data);
        let discovered = api.discover().await.unwrap();
        (api.read_all().await.unwrap(), discovered)
    });

    assert_eq!(discovered, vec!["New|TempSensorMock-1".to_string()]);
    for sid in ["SystemInfo", "boil", "New|TempSensorMock-1"] {
        assert!(listing.contains_key(sid), "{sid} missing");
    }
}

#[test]
fn unknown_id_fails_before_the_wire() {
    let rig = &Rig::new();
    let (err, requests) = rig.ready(|_| async move {
        let before = rig.sim.requests();
        let err = rig.blocks().read("no-such-block").await.unwrap_err();
        (err, rig.sim.requests() - before)
    });
    assert_eq!(err.http_status(), 404);
    assert_eq!(requests, 0);
}
