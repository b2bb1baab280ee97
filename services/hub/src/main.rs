// hub: the server-side brain of the Widuino sensor network.
//
// Startup wiring: open the store, register the receive processors (log
// writer, RF store writer, decoders) on the fan-out, start the RPC
// listener and the UDP gateway.  Fatal resource errors exit the process.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use hub::db::HubDb;
use hub::fanout::Fanout;
use hub::rpc::{self, RpcDeps};
use hub::store::SqliteKv;
use hub::udpgw::UdpGateway;
use hub::{decoders, logwriter};
use wd_boot::{Booter, SketchRepo, repo};

#[derive(Parser, Debug)]
#[command(name = "hub", version, about = "Widuino sensor network hub")]
struct Args {
    /// UDP port the RF gateways connect to
    #[arg(long, default_value_t = 9999)]
    udp_port: u16,
    /// TCP address the RPC listener binds
    #[arg(long, default_value = "127.0.0.1:9323")]
    rpc_addr: String,
    /// Directory for the persistent store
    #[arg(long, default_value = "_data")]
    data_dir: PathBuf,
    /// Boot configuration file (pairing and sketch maps)
    #[arg(long, default_value = "sketches.json")]
    boot_config: PathBuf,
    /// Directory for the daily RF message logs
    #[arg(long, default_value = "_log")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "hub starting");

    if let Err(e) = run(args).await {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    // persistent store
    std::fs::create_dir_all(&args.data_dir)?;
    let store_path = args.data_dir.join("hub.db");
    info!(path = %store_path.display(), "opening store");
    let db = Arc::new(HubDb::new(Box::new(SqliteKv::open(&store_path)?)));

    // receive fan-out with the standard processors
    let fanout = Fanout::new();
    logwriter::spawn(fanout.register(), args.log_dir.clone());
    db.spawn_rf_writer(fanout.register());
    decoders::spawn(fanout.register(), Arc::clone(&db));
    let (recv_tx, recv_rx) = mpsc::channel(10);
    fanout.spawn_distributor(recv_rx);

    // transmit queue, buffered to ride out retransmit delays
    let (xmit_tx, xmit_rx) = mpsc::channel(100);

    // firmware repository with hot reload
    let sketch_repo = SketchRepo::open(&args.boot_config)?;
    repo::spawn_watcher(&sketch_repo)?;
    let boot = Arc::new(Booter::new(sketch_repo));

    // RPC listener
    let listener = TcpListener::bind(&args.rpc_addr).await?;
    info!(addr = %args.rpc_addr, "listening for RPC connections");
    tokio::spawn(rpc::serve(listener, RpcDeps { db: Arc::clone(&db), xmit: xmit_tx }));

    // UDP gateway; runs the receive loop on this task
    let gateway = UdpGateway::bind(args.udp_port, recv_tx, boot).await?;
    info!(port = args.udp_port, "listening on UDP");
    gateway.run(xmit_rx).await;
    Ok(())
}
