//! Full path: UDP packet in, ACK out, store, fan-out to the log writer and
//! decoders, live RPC subscribers.

mod common;

use std::time::Duration;

use tokio::net::UdpSocket;
use wd_protocol::Connection;

#[tokio::test]
async fn udp_packet_flows_to_rpc_subscribers_log_and_sensors() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();

    let mut rf_stream = client.rf_subscribe(1, "").await.unwrap();

    // a node in group 212 reports a temperature, ACK requested
    let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    node.send_to(&[1, 212, 5, 4, 68], hub.gw_addr).await.unwrap();

    let mut buf = [0u8; 16];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), node.recv_from(&mut buf))
        .await
        .expect("no ACK")
        .unwrap();
    assert_eq!(&buf[..len], &[6, 212, 5]);

    // the RF subscriber sees the stored message
    let m = tokio::time::timeout(Duration::from_secs(5), rf_stream.recv())
        .await
        .expect("no RF message")
        .expect("stream closed");
    assert_eq!((m.group, m.node, m.kind), (212, 5, 4));
    assert_eq!(m.data, vec![68]);
    assert!(m.at > 0);

    // the decoder turned it into a sensor reading
    let mut sensor = client.sensor_subscribe("RFg212i05k04/temp", 1).await.unwrap();
    let v = tokio::time::timeout(Duration::from_secs(5), sensor.recv())
        .await
        .expect("no sensor value")
        .expect("stream closed");
    assert_eq!(v.value, 68.0);
    let info = client.sensor_info("RFg212i05k04/temp").await.unwrap();
    assert_eq!(info.unit, "F");

    // the log writer appended one line for the message
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let logged = std::fs::read_dir(&hub.log_dir)
            .ok()
            .and_then(|mut entries| entries.next())
            .and_then(|e| std::fs::read_to_string(e.ok()?.path()).ok())
            .is_some_and(|text| text.contains("d4 05 04 02: 44"));
        if logged {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "log line never appeared");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn connection_loss_reaps_subscriptions() {
    let hub = common::start_hub().await;
    let client = Connection::connect(hub.rpc_addr).await.unwrap();
    let _stream = client.rf_subscribe(0, "").await.unwrap();

    client.close();

    // once the server notices, new writes must not block on the dead
    // subscriber; a fresh client still works
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..300i64 {
        hub.db
            .put_rf_message(wd_protocol::RFMessage {
                at: 1000 + i,
                group: 1,
                ..Default::default()
            })
            .await
            .unwrap();
    }
    let client2 = Connection::connect(hub.rpc_addr).await.unwrap();
    assert_eq!(client2.echo("alive").await.unwrap(), "alive");
}
