//! Boots a complete hub on ephemeral ports for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use hub::db::HubDb;
use hub::fanout::Fanout;
use hub::rpc::{self, RpcDeps};
use hub::store::SqliteKv;
use hub::udpgw::UdpGateway;
use hub::{decoders, logwriter};
use wd_boot::{Booter, SketchRepo};

const CONFIG: &str = r#"
# test pairing table
{
  "00000000000000000000000000000000": [100, 252, 2],
  "01020304000000000000000000000000": [101, 252, 3]
}
{ "100": "node.hex" }
"#;

pub struct TestHub {
    pub rpc_addr: SocketAddr,
    /// Where UDP test packets go.
    pub gw_addr: SocketAddr,
    pub db: Arc<HubDb>,
    pub log_dir: PathBuf,
    _dir: tempfile::TempDir,
}

fn hex_record(addr: u16, data: &[u8]) -> String {
    let mut b = vec![data.len() as u8, (addr >> 8) as u8, addr as u8, 0x00];
    b.extend_from_slice(data);
    let sum: u8 = b.iter().fold(0u8, |acc, &v| acc.wrapping_add(v));
    b.push(sum.wrapping_neg());
    format!(":{}", hex::encode_upper(&b))
}

/// Start every hub component wired together, as `main` does, but on
/// ephemeral ports with an in-memory store and a temp sketch repository.
pub async fn start_hub() -> TestHub {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sketches.json"), CONFIG).unwrap();
    let image: Vec<u8> = (0u8..32).collect();
    let mut hex_text = String::new();
    for (i, chunk) in image.chunks(16).enumerate() {
        hex_text.push_str(&hex_record((i * 16) as u16, chunk));
        hex_text.push('\n');
    }
    std::fs::write(dir.path().join("node.hex"), hex_text).unwrap();

    let db = Arc::new(HubDb::new(Box::new(SqliteKv::open_in_memory().unwrap())));

    let fanout = Fanout::new();
    let log_dir = dir.path().join("_log");
    logwriter::spawn(fanout.register(), log_dir.clone());
    db.spawn_rf_writer(fanout.register());
    decoders::spawn(fanout.register(), Arc::clone(&db));
    let (recv_tx, recv_rx) = mpsc::channel(10);
    fanout.spawn_distributor(recv_rx);

    let (xmit_tx, xmit_rx) = mpsc::channel(100);

    let repo = SketchRepo::open(dir.path().join("sketches.json")).unwrap();
    let boot = Arc::new(Booter::new(repo));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rpc_addr = listener.local_addr().unwrap();
    tokio::spawn(rpc::serve(listener, RpcDeps { db: Arc::clone(&db), xmit: xmit_tx }));

    let gateway = UdpGateway::bind(0, recv_tx, boot).await.unwrap();
    let gw_port = gateway.local_addr().unwrap().port();
    tokio::spawn(gateway.run(xmit_rx));

    TestHub {
        rpc_addr,
        gw_addr: SocketAddr::from(([127, 0, 0, 1], gw_port)),
        db,
        log_dir,
        _dir: dir,
    }
}
