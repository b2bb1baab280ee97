//! One-to-many distribution of received RF messages.
//!
//! The UDP gateway pushes every decoded message into a single receive
//! channel; the distributor task duplicates each one to every registered
//! processor (log writer, RF store writer, decoders, ...).  Processors may
//! register at any time; removal is not needed in-process.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use wd_protocol::RFMessage;

/// Per-processor channel capacity.
pub const PROCESSOR_CAPACITY: usize = 10;

#[derive(Clone, Default)]
pub struct Fanout {
    procs: Arc<Mutex<Vec<mpsc::Sender<RFMessage>>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Fanout::default()
    }

    /// Register a new processor and return its channel.
    pub fn register(&self) -> mpsc::Receiver<RFMessage> {
        let (tx, rx) = mpsc::channel(PROCESSOR_CAPACITY);
        self.procs.lock().expect("fanout lock").push(tx);
        rx
    }

    /// Start the distributor: every message from `rx` goes to every
    /// processor.  Ends when the receive channel closes.
    pub fn spawn_distributor(&self, mut rx: mpsc::Receiver<RFMessage>) -> JoinHandle<()> {
        let procs = Arc::clone(&self.procs);
        tokio::spawn(async move {
            while let Some(m) = rx.recv().await {
                let targets: Vec<mpsc::Sender<RFMessage>> =
                    procs.lock().expect("fanout lock").clone();
                for tx in targets {
                    // a processor that dropped its receiver just misses out
                    let _ = tx.send(m.clone()).await;
                }
            }
            debug!("receive fan-out closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_processor_sees_every_message() {
        let fanout = Fanout::new();
        let mut a = fanout.register();
        let mut b = fanout.register();
        let (tx, rx) = mpsc::channel(10);
        fanout.spawn_distributor(rx);

        for i in 0..3u8 {
            tx.send(RFMessage { group: i, ..Default::default() }).await.unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(a.recv().await.unwrap().group, i);
            assert_eq!(b.recv().await.unwrap().group, i);
        }
    }

    #[tokio::test]
    async fn late_registration_gets_later_messages() {
        let fanout = Fanout::new();
        let mut a = fanout.register();
        let (tx, rx) = mpsc::channel(10);
        fanout.spawn_distributor(rx);

        tx.send(RFMessage { group: 1, ..Default::default() }).await.unwrap();
        assert_eq!(a.recv().await.unwrap().group, 1);

        let mut b = fanout.register();
        tx.send(RFMessage { group: 2, ..Default::default() }).await.unwrap();
        assert_eq!(a.recv().await.unwrap().group, 2);
        assert_eq!(b.recv().await.unwrap().group, 2);
    }

    #[tokio::test]
    async fn dead_processor_does_not_block_the_rest() {
        let fanout = Fanout::new();
        let a = fanout.register();
        let mut b = fanout.register();
        drop(a);
        let (tx, rx) = mpsc::channel(10);
        fanout.spawn_distributor(rx);

        tx.send(RFMessage { group: 7, ..Default::default() }).await.unwrap();
        assert_eq!(b.recv().await.unwrap().group, 7);
    }
}
