//! Streaming subscriptions and pushes over a real RPC connection.

mod common;

use std::time::Duration;

use tokio::net::UdpSocket;
use wd_protocol::{Connection, RFMessage, SensorDataValue, SensorInfo};

async fn recv_timeout<T>(rx: &mut tokio::sync::mpsc::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for stream item")
        .expect("stream closed early")
}

#[tokio::test]
async fn rf_subscribe_replays_history_and_bridges_into_live_writes() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();
    let t = 1_400_000_000_000i64;

    for i in 0..10 {
        hub.db
            .put_rf_message(RFMessage {
                at: t + i,
                group: (2 * i) as u8,
                node: 13,
                ..Default::default()
            })
            .await
            .unwrap();
    }
    let mut stream = client.rf_subscribe(t + 4, "").await.unwrap();
    for i in 10..20 {
        hub.db
            .put_rf_message(RFMessage {
                at: t + i,
                group: (2 * i) as u8,
                node: 13,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let mut groups = Vec::new();
    for _ in 0..16 {
        groups.push(recv_timeout(&mut stream).await.group);
    }
    let expect: Vec<u8> = (4..20).map(|i| (2 * i) as u8).collect();
    assert_eq!(groups, expect);
}

#[tokio::test]
async fn rf_subscribe_match_filters_by_tag_prefix() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();

    for (at, group) in [(100i64, 7u8), (101, 8), (102, 7)] {
        hub.db
            .put_rf_message(RFMessage { at, group, node: 1, kind: 4, ..Default::default() })
            .await
            .unwrap();
    }
    let mut stream = client.rf_subscribe(1, "RFg007").await.unwrap();
    assert_eq!(recv_timeout(&mut stream).await.at, 100);
    assert_eq!(recv_timeout(&mut stream).await.at, 102);
}

#[tokio::test]
async fn rf_send_reaches_the_udp_gateway() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();

    // teach the gateway this group's return address
    let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    node.send_to(&[0, 212, 5, 1], hub.gw_addr).await.unwrap();

    client
        .rf_send(RFMessage { group: 212, node: 9, kind: 5, data: vec![1, 2], ..Default::default() })
        .await
        .unwrap();

    let mut buf = [0u8; 128];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), node.recv_from(&mut buf))
        .await
        .expect("no UDP packet")
        .unwrap();
    assert_eq!(&buf[..len], &[3, 212, 9, 5, 1, 2]);
}

#[tokio::test]
async fn sensor_data_push_stores_info_and_values() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();

    let info = SensorInfo { unit: "F".into(), rate: false };
    let sink = client.sensor_data("porch/temp", info.clone()).await.unwrap();
    for (at, value) in [(100i64, 68.0), (110, 69.0), (120, 70.5)] {
        sink.send(SensorDataValue { at, value }).await.unwrap();
    }
    sink.close().await.unwrap();

    assert_eq!(client.sensor_info("porch/temp").await.unwrap(), info);

    // subscribing from the start replays everything the push stored
    let mut stream = client.sensor_subscribe("porch/temp", 1).await.unwrap();
    let mut got = Vec::new();
    for _ in 0..3 {
        let v = recv_timeout(&mut stream).await;
        got.push((v.at, v.value));
    }
    assert_eq!(got, vec![(100, 68.0), (110, 69.0), (120, 70.5)]);
}

#[tokio::test]
async fn sensor_data_push_with_default_info_still_registers_the_sensor() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();

    // unitless, non-rate metadata is a legitimate payload and must be
    // stored like any other
    let sink = client.sensor_data("bare/counter", SensorInfo::default()).await.unwrap();
    sink.send(SensorDataValue { at: 5, value: 1.0 }).await.unwrap();
    sink.close().await.unwrap();

    assert_eq!(client.sensor_info("bare/counter").await.unwrap(), SensorInfo::default());
}

#[tokio::test]
async fn sensor_subscribe_delivers_live_values_after_history() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();

    hub.db.put_sensor_value("tank/level", SensorDataValue { at: 50, value: 1.0 }).await.unwrap();
    let mut stream = client.sensor_subscribe("tank/level", 1).await.unwrap();
    assert_eq!(recv_timeout(&mut stream).await.value, 1.0);

    hub.db.put_sensor_value("tank/level", SensorDataValue { at: 60, value: 2.0 }).await.unwrap();
    let v = recv_timeout(&mut stream).await;
    assert_eq!((v.at, v.value), (60, 2.0));
}

#[tokio::test]
async fn sensor_read_streams_interpolated_slot_averages() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();
    let s = 1_400_000_000_000i64;

    for (dt, value) in [(0i64, 1.0), (20, 2.0), (30, 3.0), (50, 4.0), (100, 9.0)] {
        hub.db
            .put_sensor_value("lab/gauge", SensorDataValue { at: s + dt, value })
            .await
            .unwrap();
    }

    let mut stream = client.sensor_read("lab/gauge", s, s + 120, 20).await.unwrap();
    let mut got = Vec::new();
    while let Some(v) = stream.recv().await {
        got.push(v);
    }
    assert_eq!(got.len(), 6);
    let expect_avg = [1.5, 2.875, 4.125, 6.0, 8.0, 9.0];
    for (i, v) in got.iter().enumerate() {
        assert_eq!(v.at, s + 20 * i as i64);
        assert!((v.value - expect_avg[i]).abs() < 1e-9, "slot {i}: {} != {}", v.value, expect_avg[i]);
    }
}

#[tokio::test]
async fn sensor_read_rejects_a_bad_step() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();
    assert!(client.sensor_read("x", 10, 20, 1).await.is_err());
    assert!(client.sensor_read("x", 20, 10, 10).await.is_err());
}
