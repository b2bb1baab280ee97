//! Client-side RPC connection.
//!
//! Multiplexes typed requests and subscription streams over one TCP
//! connection.  Three tasks per connection: a writer draining the outgoing
//! frame queue, a reader demultiplexing incoming frames to reply waiters
//! and stream receivers, and a pinger that issues an Echo every second and
//! tears the connection down when a reply misses its one-second budget.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::frame::{Envelope, EnvelopeCodec, FrameError, MAIN_CHANNEL, decode_body, encode_body};
use crate::message::{RFMessage, SensorDataValue, SensorInfo};
use crate::rpc::{
    ChannelId, Code, Reply, Request, RFSubRequest, SensorDataRequest, SensorInfoRequest,
    SensorReadRequest, SensorSubRequest,
};

/// Interval between keepalive echoes, and also their RTT budget.
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of subscription stream channels, matching the server side.
const STREAM_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request failed ({code:?}): {error}")]
    Remote { code: Code, error: String },
    #[error("protocol: {0}")]
    Protocol(String),
}

struct ConnInner {
    out: mpsc::Sender<Envelope>,
    pending: StdMutex<HashMap<ChannelId, oneshot::Sender<Reply>>>,
    streams: StdMutex<HashMap<ChannelId, mpsc::Sender<Vec<u8>>>>,
    next_ch: AtomicU32,
    closed_tx: watch::Sender<bool>,
}

impl ConnInner {
    fn alloc_ch(&self) -> ChannelId {
        self.next_ch.fetch_add(1, Ordering::Relaxed)
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
        self.fail_all();
    }

    /// Wake every reply waiter and stream consumer with a closed channel.
    fn fail_all(&self) {
        self.pending.lock().expect("pending lock").clear();
        self.streams.lock().expect("streams lock").clear();
    }

    async fn dispatch(&self, env: Envelope) {
        if let Some(waiter) = self.pending.lock().expect("pending lock").remove(&env.ch) {
            match decode_body::<Reply>(&env.body) {
                Ok(reply) => {
                    let _ = waiter.send(reply);
                }
                Err(e) => warn!(ch = env.ch, error = %e, "undecodable reply"),
            }
            return;
        }

        let stream = self.streams.lock().expect("streams lock").get(&env.ch).cloned();
        if let Some(tx) = stream {
            if !env.body.is_empty() {
                let _ = tx.send(env.body).await;
            }
            if env.end {
                self.streams.lock().expect("streams lock").remove(&env.ch);
            }
        } else {
            debug!(ch = env.ch, "frame for unknown channel dropped");
        }
    }
}

/// A live RPC connection to the hub.  Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Connect and start the connection tasks, including the pinger.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Connection, ClientError> {
        Ok(Self::from_stream(TcpStream::connect(addr).await?))
    }

    /// Wrap an already-connected socket (used by tests and by `connect`).
    pub fn from_stream(stream: TcpStream) -> Connection {
        let (read_half, write_half) = stream.into_split();
        let mut sink = FramedWrite::new(write_half, EnvelopeCodec::default());
        let mut source = FramedRead::new(read_half, EnvelopeCodec::default());

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
        let (closed_tx, closed_rx) = watch::channel(false);
        let inner = Arc::new(ConnInner {
            out: out_tx,
            pending: StdMutex::new(HashMap::new()),
            streams: StdMutex::new(HashMap::new()),
            next_ch: AtomicU32::new(1),
            closed_tx,
        });

        // writer: drain the outgoing queue until close or socket error
        let mut writer_closed = closed_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    env = out_rx.recv() => match env {
                        Some(env) => {
                            if sink.send(env).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_closed.changed() => break,
                }
            }
        });

        // reader: demultiplex incoming frames until EOF or close
        let reader_inner = Arc::clone(&inner);
        let mut reader_closed = closed_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = source.next() => match frame {
                        Some(Ok(env)) => reader_inner.dispatch(env).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "connection read error");
                            break;
                        }
                        None => break,
                    },
                    _ = reader_closed.changed() => break,
                }
            }
            reader_inner.close();
        });

        let conn = Connection { inner };
        conn.spawn_pinger();
        conn
    }

    /// Keepalive: one Echo per second with a one-second budget; a miss
    /// tears the connection down.
    fn spawn_pinger(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it so a fresh
            // connection isn't pinged before the caller's first request
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *conn.inner.closed_tx.borrow() {
                    return;
                }
                match tokio::time::timeout(PING_INTERVAL, conn.request(Request::echo("ping")))
                    .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(ClientError::ConnectionClosed)) => return,
                    Ok(Err(e)) => {
                        warn!(error = %e, "ping failed, closing connection");
                        conn.inner.close();
                        return;
                    }
                    Err(_) => {
                        warn!("ping reply missed its deadline, closing connection");
                        conn.inner.close();
                        return;
                    }
                }
            }
        });
    }

    /// Close the connection and wake all waiters.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Send one request and await its reply.
    pub async fn request(&self, mut req: Request) -> Result<Reply, ClientError> {
        if *self.inner.closed_tx.borrow() {
            return Err(ClientError::ConnectionClosed);
        }
        let ch = self.inner.alloc_ch();
        req.reply = ch;
        let body = encode_body(&req)?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().expect("pending lock").insert(ch, tx);

        if self.inner.out.send(Envelope::new(MAIN_CHANNEL, body)).await.is_err() {
            self.inner.pending.lock().expect("pending lock").remove(&ch);
            return Err(ClientError::ConnectionClosed);
        }
        // a teardown racing the send above may have swept `pending` before
        // our entry landed; don't wait on a waiter nobody will wake
        if *self.inner.closed_tx.borrow() {
            self.inner.pending.lock().expect("pending lock").remove(&ch);
            return Err(ClientError::ConnectionClosed);
        }
        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Send one request and demand an OK reply.
    async fn request_ok(&self, req: Request) -> Result<Reply, ClientError> {
        let reply = self.request(req).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(ClientError::Remote { code: reply.code, error: reply.error })
        }
    }

    /// Register a stream channel and return its raw receiver.
    fn open_stream(&self, ch: ChannelId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        self.inner.streams.lock().expect("streams lock").insert(ch, tx);
        rx
    }

    fn drop_stream(&self, ch: ChannelId) {
        self.inner.streams.lock().expect("streams lock").remove(&ch);
    }

    /// Decode raw stream frames into typed items on a fresh channel.
    fn typed_stream<T>(&self, mut raw: mpsc::Receiver<Vec<u8>>) -> mpsc::Receiver<T>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        tokio::spawn(async move {
            while let Some(body) = raw.recv().await {
                match decode_body::<T>(&body) {
                    Ok(item) => {
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable stream item");
                        break;
                    }
                }
            }
        });
        rx
    }

    // -----------------------------------------------------------------------
    // Typed request helpers
    // -----------------------------------------------------------------------

    pub async fn echo(&self, text: impl Into<String>) -> Result<String, ClientError> {
        let reply = self.request_ok(Request::echo(text)).await?;
        reply.er.ok_or_else(|| ClientError::Protocol("echo reply without text".into()))
    }

    /// Transmit one RF message through the hub.
    pub async fn rf_send(&self, m: RFMessage) -> Result<(), ClientError> {
        self.request_ok(Request::rf_send(m)).await.map(|_| ())
    }

    /// Subscribe to RF messages; history from `start_at` first when
    /// positive, then the live tail.
    pub async fn rf_subscribe(
        &self,
        start_at: i64,
        match_tag: impl Into<String>,
    ) -> Result<mpsc::Receiver<RFMessage>, ClientError> {
        let ch = self.inner.alloc_ch();
        let raw = self.open_stream(ch);
        let req = Request {
            rfs: Some(RFSubRequest { start_at, match_tag: match_tag.into(), messages: ch }),
            ..Default::default()
        };
        if let Err(e) = self.request_ok(req).await {
            self.drop_stream(ch);
            return Err(e);
        }
        Ok(self.typed_stream(raw))
    }

    pub async fn sensor_info(&self, name: impl Into<String>) -> Result<SensorInfo, ClientError> {
        let req =
            Request { si: Some(SensorInfoRequest { name: name.into() }), ..Default::default() };
        let reply = self.request_ok(req).await?;
        reply.si.ok_or_else(|| ClientError::Protocol("sensor info reply without payload".into()))
    }

    /// Open a client -> server value stream for one sensor.
    pub async fn sensor_data(
        &self,
        name: impl Into<String>,
        info: SensorInfo,
    ) -> Result<SensorDataSink, ClientError> {
        let ch = self.inner.alloc_ch();
        let req = Request {
            sd: Some(SensorDataRequest { name: name.into(), info, values: ch }),
            ..Default::default()
        };
        self.request_ok(req).await?;
        Ok(SensorDataSink { out: self.inner.out.clone(), ch })
    }

    /// Read an interpolated range of one sensor as a finite stream.
    pub async fn sensor_read(
        &self,
        name: impl Into<String>,
        start_at: i64,
        end_at: i64,
        step: i64,
    ) -> Result<mpsc::Receiver<SensorDataValue>, ClientError> {
        let ch = self.inner.alloc_ch();
        let raw = self.open_stream(ch);
        let req = Request {
            sr: Some(SensorReadRequest { name: name.into(), start_at, end_at, step, values: ch }),
            ..Default::default()
        };
        if let Err(e) = self.request_ok(req).await {
            self.drop_stream(ch);
            return Err(e);
        }
        Ok(self.typed_stream(raw))
    }

    /// Subscribe to one sensor's values.
    pub async fn sensor_subscribe(
        &self,
        name: impl Into<String>,
        start_at: i64,
    ) -> Result<mpsc::Receiver<SensorDataValue>, ClientError> {
        let ch = self.inner.alloc_ch();
        let raw = self.open_stream(ch);
        let req = Request {
            ss: Some(SensorSubRequest { name: name.into(), start_at, values: ch }),
            ..Default::default()
        };
        if let Err(e) = self.request_ok(req).await {
            self.drop_stream(ch);
            return Err(e);
        }
        Ok(self.typed_stream(raw))
    }
}

/// Write end of a client -> server sensor value stream.
pub struct SensorDataSink {
    out: mpsc::Sender<Envelope>,
    ch: ChannelId,
}

impl SensorDataSink {
    pub async fn send(&self, value: SensorDataValue) -> Result<(), ClientError> {
        let body = encode_body(&value)?;
        self.out
            .send(Envelope::new(self.ch, body))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Close the stream; the server stops reading values for it.
    pub async fn close(self) -> Result<(), ClientError> {
        self.out
            .send(Envelope::close(self.ch))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }
}
