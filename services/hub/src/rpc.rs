//! RPC server: typed requests and subscription streams over one framed
//! TCP connection per client.
//!
//! Per connection: a writer task drains the outgoing frame queue, the
//! reader loop dispatches main-channel requests and routes client->server
//! stream frames (sensor data pushes) to their handlers.  Subscription
//! forwarder tasks bridge pub/sub streams into client channels; on a send
//! error they unsubscribe and drain so publishers never block on a dead
//! client.  When the connection dies, every subscription it owns is
//! reaped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use wd_interpol::{interpolate, Kind, RawPoint};
use wd_protocol::frame::{Envelope, EnvelopeCodec, MAIN_CHANNEL, decode_body, encode_body};
use wd_protocol::rpc::{
    ChannelId, Reply, Request, RFSubRequest, SensorDataRequest, SensorReadRequest,
    SensorSubRequest,
};
use wd_protocol::{RFMessage, SensorDataValue};

use crate::db::HubDb;
use crate::pubsub::{SubId, Subscription};
use crate::store::StoreError;

/// Raw input points fetched per interpolated read; overruns are logged.
const READ_RAW_LIMIT: usize = 500_000;

/// Handles shared by every connection.
#[derive(Clone)]
pub struct RpcDeps {
    pub db: Arc<HubDb>,
    /// Transmit queue drained by the UDP gateway.
    pub xmit: mpsc::Sender<RFMessage>,
}

/// Accept loop; runs until the listener fails.
pub async fn serve(listener: TcpListener, deps: RpcDeps) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "RPC connection");
                tokio::spawn(handle_conn(stream, deps.clone()));
            }
            Err(e) => {
                error!(error = %e, "RPC accept failed");
                return;
            }
        }
    }
}

/// What to reap when the connection goes away.
enum OwnedSub {
    Rf(SubId),
    Sensor(String, SubId),
}

struct ConnShared {
    out: mpsc::Sender<Envelope>,
    /// Client -> server stream routing (sensor data pushes).
    in_streams: StdMutex<HashMap<ChannelId, mpsc::Sender<Vec<u8>>>>,
    subs: StdMutex<Vec<OwnedSub>>,
}

async fn handle_conn(stream: TcpStream, deps: RpcDeps) {
    let (read_half, write_half) = stream.into_split();
    let mut source = tokio_util::codec::FramedRead::new(read_half, EnvelopeCodec::default());
    let mut sink = tokio_util::codec::FramedWrite::new(write_half, EnvelopeCodec::default());

    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
    tokio::spawn(async move {
        while let Some(env) = out_rx.recv().await {
            if sink.send(env).await.is_err() {
                break;
            }
        }
    });

    let conn = Arc::new(ConnShared {
        out: out_tx,
        in_streams: StdMutex::new(HashMap::new()),
        subs: StdMutex::new(Vec::new()),
    });

    loop {
        match source.next().await {
            Some(Ok(env)) if env.ch == MAIN_CHANNEL => {
                let req = match decode_body::<Request>(&env.body) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!(error = %e, "undecodable request, closing connection");
                        break;
                    }
                };
                debug!(reply_ch = req.reply, "request");
                let reply_ch = req.reply;
                let reply = handle_request(req, &conn, &deps).await;
                let body = match encode_body(&reply) {
                    Ok(body) => body,
                    Err(e) => {
                        error!(error = %e, "cannot encode reply");
                        break;
                    }
                };
                let frame = Envelope { ch: reply_ch, end: true, body };
                if conn.out.send(frame).await.is_err() {
                    break;
                }
            }
            Some(Ok(env)) => {
                // client -> server stream frame
                let tx = conn.in_streams.lock().expect("in_streams lock").get(&env.ch).cloned();
                match tx {
                    Some(tx) => {
                        if !env.body.is_empty() {
                            let _ = tx.send(env.body).await;
                        }
                        if env.end {
                            conn.in_streams.lock().expect("in_streams lock").remove(&env.ch);
                        }
                    }
                    None => debug!(ch = env.ch, "frame for unknown stream dropped"),
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "connection read error");
                break;
            }
            None => break,
        }
    }

    reap(&conn, &deps).await;
    info!("RPC connection closed");
}

/// Release everything the connection owned: incoming streams end, and all
/// of its subscriptions are unsubscribed (idempotent with the forwarder
/// tasks' own cleanup).
async fn reap(conn: &Arc<ConnShared>, deps: &RpcDeps) {
    conn.in_streams.lock().expect("in_streams lock").clear();
    let owned: Vec<OwnedSub> = std::mem::take(&mut *conn.subs.lock().expect("subs lock"));
    for sub in owned {
        match sub {
            OwnedSub::Rf(id) => deps.db.rf_unsubscribe(id).await,
            OwnedSub::Sensor(name, id) => deps.db.sensor_unsubscribe(&name, id).await,
        }
    }
}

async fn handle_request(req: Request, conn: &Arc<ConnShared>, deps: &RpcDeps) -> Reply {
    if req.populated() > 1 {
        return Reply::client_error("more than one request payload populated");
    }
    if let Some(er) = req.er {
        return Reply { er: Some(er.text), ..Reply::ok() };
    }
    if let Some(rfs) = req.rfs {
        return handle_rf_sub(rfs, conn, deps).await;
    }
    if let Some(rf) = req.rf {
        return match deps.xmit.send(rf.0).await {
            Ok(()) => Reply::ok(),
            Err(_) => Reply::server_error("transmit queue closed"),
        };
    }
    if let Some(si) = req.si {
        return match deps.db.get_sensor_info(&si.name) {
            Ok(info) => Reply { si: Some(info), ..Reply::ok() },
            Err(StoreError::NotFound) => Reply::client_error("key not found"),
            Err(e) => Reply::server_error(e.to_string()),
        };
    }
    if let Some(sd) = req.sd {
        return handle_sensor_data(sd, conn, deps);
    }
    if let Some(sr) = req.sr {
        return handle_sensor_read(sr, conn, deps);
    }
    if let Some(ss) = req.ss {
        return handle_sensor_sub(ss, conn, deps).await;
    }
    if req.pp.is_some() || req.pg.is_some() {
        return Reply::server_error("not implemented");
    }
    Reply::client_error("no handler available for request")
}

// ---------------------------------------------------------------------------
// Subscriptions (server -> client streams)
// ---------------------------------------------------------------------------

async fn handle_rf_sub(req: RFSubRequest, conn: &Arc<ConnShared>, deps: &RpcDeps) -> Reply {
    if req.messages == MAIN_CHANNEL {
        return Reply::client_error("messages channel is missing");
    }
    let sub = deps.db.rf_subscribe(req.start_at);
    info!(start_at = req.start_at, match_tag = %req.match_tag, "RF subscriber started");
    conn.subs.lock().expect("subs lock").push(OwnedSub::Rf(sub.id));

    let conn = Arc::clone(conn);
    let db = Arc::clone(&deps.db);
    tokio::spawn(async move {
        let match_tag = req.match_tag;
        forward_stream(sub, req.messages, &conn, move |m: &RFMessage| {
            match_tag.is_empty() || m.tag().starts_with(&match_tag)
        }, move |id| {
            let db = Arc::clone(&db);
            async move { db.rf_unsubscribe(id).await }
        })
        .await;
    });
    Reply::ok()
}

async fn handle_sensor_sub(req: SensorSubRequest, conn: &Arc<ConnShared>, deps: &RpcDeps) -> Reply {
    if req.values == MAIN_CHANNEL {
        return Reply::client_error("values channel is missing");
    }
    let sub = deps.db.sensor_subscribe(&req.name, req.start_at).await;
    info!(name = %req.name, start_at = req.start_at, "sensor subscriber started");
    conn.subs.lock().expect("subs lock").push(OwnedSub::Sensor(req.name.clone(), sub.id));

    let conn = Arc::clone(conn);
    let db = Arc::clone(&deps.db);
    let name = req.name;
    tokio::spawn(async move {
        forward_stream(sub, req.values, &conn, |_: &SensorDataValue| true, move |id| {
            let db = Arc::clone(&db);
            let name = name.clone();
            async move { db.sensor_unsubscribe(&name, id).await }
        })
        .await;
    });
    Reply::ok()
}

/// Bridge one subscription into a client channel.  On a send error:
/// unsubscribe, drain the stream (to unblock publishers), exit.  When the
/// topic closes the stream (unsubscribe path), close the client channel.
async fn forward_stream<T, P, U, F>(
    mut sub: Subscription<T>,
    ch: ChannelId,
    conn: &Arc<ConnShared>,
    pass: P,
    unsubscribe: U,
) where
    T: serde::Serialize + Send + 'static,
    P: Fn(&T) -> bool,
    U: Fn(SubId) -> F,
    F: Future<Output = ()>,
{
    let mut client_gone = false;
    while let Some(m) = sub.rx.recv().await {
        if !pass(&m) {
            continue;
        }
        let body = match encode_body(&m) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "cannot encode stream item");
                continue;
            }
        };
        if conn.out.send(Envelope::new(ch, body)).await.is_err() {
            client_gone = true;
            break;
        }
    }
    if client_gone {
        debug!(ch, "client gone, unsubscribing");
        // keep draining while unsubscribing: a publisher may be parked on
        // our full channel while holding the lock unsubscribe needs
        let Subscription { id, mut rx } = sub;
        let drainer = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        unsubscribe(id).await;
        let _ = drainer.await;
        return;
    }
    debug!(ch, "subscription closed");
    let _ = conn.out.send(Envelope::close(ch)).await;
}

// ---------------------------------------------------------------------------
// Sensor data push (client -> server stream)
// ---------------------------------------------------------------------------

fn handle_sensor_data(req: SensorDataRequest, conn: &Arc<ConnShared>, deps: &RpcDeps) -> Reply {
    if req.values == MAIN_CHANNEL {
        return Reply::client_error("values channel is missing");
    }
    if !req.name.is_empty() {
        if let Err(e) = deps.db.put_sensor_info(&req.name, &req.info) {
            return Reply::server_error(e.to_string());
        }
    }

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(crate::pubsub::SUBSCRIBER_CAPACITY);
    conn.in_streams.lock().expect("in_streams lock").insert(req.values, tx);

    let db = Arc::clone(&deps.db);
    let name = req.name;
    info!(name = %name, "sensor data push started");
    tokio::spawn(async move {
        while let Some(body) = rx.recv().await {
            match decode_body::<SensorDataValue>(&body) {
                Ok(v) => {
                    if let Err(e) = db.put_sensor_value(&name, v).await {
                        warn!(name = %name, error = %e, "cannot store sensor value");
                    }
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "undecodable sensor value");
                    return;
                }
            }
        }
        debug!(name = %name, "sensor data push ended");
    });
    Reply::ok()
}

// ---------------------------------------------------------------------------
// Interpolated sensor read (server -> client stream)
// ---------------------------------------------------------------------------

fn handle_sensor_read(req: SensorReadRequest, conn: &Arc<ConnShared>, deps: &RpcDeps) -> Reply {
    if req.values == MAIN_CHANNEL {
        return Reply::client_error("values channel is missing");
    }
    if req.step < 2 || req.end_at <= req.start_at {
        return Reply::client_error("bad range or step");
    }

    let conn = Arc::clone(conn);
    let db = Arc::clone(&deps.db);
    info!(name = %req.name, start = req.start_at, end = req.end_at, step = req.step,
        "sensor read started");
    tokio::spawn(async move {
        let rate = db.get_sensor_info(&req.name).map(|i| i.rate).unwrap_or(false);
        let kind = if rate { Kind::Rate } else { Kind::Absolute };
        // allow interpolation to reach a little outside the window
        let max_fill = req.step.saturating_mul(4);
        let from = req.start_at.saturating_sub(max_fill).max(0);
        let to = req.end_at.saturating_add(max_fill);

        let raw = match db.sensor_scan(&req.name, from, to, READ_RAW_LIMIT) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(name = %req.name, error = %e, "sensor read scan failed");
                let _ = conn.out.send(Envelope::close(req.values)).await;
                return;
            }
        };
        if raw.len() == READ_RAW_LIMIT {
            warn!(name = %req.name, limit = READ_RAW_LIMIT, "sensor read truncated raw input");
        }
        let points: Vec<RawPoint> =
            raw.iter().map(|v| RawPoint { asof: v.at, value: v.value }).collect();

        match interpolate(&points, kind, req.start_at, req.end_at, req.step, max_fill) {
            Ok(series) => {
                for p in series {
                    let v = SensorDataValue { at: p.asof, value: p.avg };
                    let Ok(body) = encode_body(&v) else { break };
                    if conn.out.send(Envelope::new(req.values, body)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(name = %req.name, error = %e, "interpolation failed"),
        }
        let _ = conn.out.send(Envelope::close(req.values)).await;
    });
    Reply::ok()
}
