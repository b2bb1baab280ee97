//! UDP gateway: bridges RF network gateways to the hub.
//!
//! One UDP socket serves every RF group; each gateway's return address is
//! learned from its packets.  Packet layout (single bytes):
//!
//! ```text
//! flags | group | node | payload...
//! ```
//!
//! `flags` dispatch on ingress: 0/1 data (1 wants an ACK), 5 boot
//! upgrade/download request, 8 pairing request, 9 gateway log line;
//! everything else is dropped with a log line.  Outgoing frames use 6 for
//! ACKs, 7 for boot replies, 8 for pairing replies, and 0x0/0x3 for
//! broadcast/addressed data.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use wd_boot::{
    Booter, DownloadRequest, PairingRequest, UpgradeRequest,
};
use wd_protocol::RFMessage;

use crate::db::now_ms;

// packet type codes in the flags byte
pub const FLAG_BCAST_PUSH: u8 = 0;
pub const FLAG_BCAST_REQ: u8 = 1;
pub const FLAG_DATA_REQ: u8 = 3;
pub const FLAG_BOOT_REQ: u8 = 5;
pub const FLAG_ACK: u8 = 6;
pub const FLAG_BOOT_REPLY: u8 = 7;
pub const FLAG_PAIRING: u8 = 8;
pub const FLAG_GW_LOG: u8 = 9;

/// 3-byte header plus a kind byte and up to 63 payload bytes.
pub const MIN_PACKET: usize = 3;
pub const MAX_PACKET: usize = 69;

/// Module ID used for gateway log lines.
const LOG_KIND: u8 = 2;
/// Module ID of the legacy gateway self-report (node 31, no kind byte).
const GW_REPORT_KIND: u8 = 8;

// ---------------------------------------------------------------------------
// Group peer map
// ---------------------------------------------------------------------------

/// group ID -> gateway UDP address, learned from inbound packets so replies
/// can be routed.  Entries are overwritten, never removed.
#[derive(Default)]
pub struct GroupMap {
    map: Mutex<HashMap<u8, SocketAddr>>,
}

impl GroupMap {
    pub fn lookup(&self, group: u8) -> Option<SocketAddr> {
        self.map.lock().expect("group map lock").get(&group).copied()
    }

    /// Learn or refresh a mapping; logs when the endpoint changes.
    pub fn save(&self, group: u8, addr: SocketAddr) {
        let mut map = self.map.lock().expect("group map lock");
        let prev = map.insert(group, addr);
        if prev != Some(addr) {
            info!(group, %addr, "RF group now reachable");
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct UdpGateway {
    sock: Arc<UdpSocket>,
    groups: Arc<GroupMap>,
    recv_tx: mpsc::Sender<RFMessage>,
    boot: Arc<Booter>,
}

impl UdpGateway {
    /// Bind the gateway socket; a bind failure is fatal to the caller.
    pub async fn bind(
        port: u16,
        recv_tx: mpsc::Sender<RFMessage>,
        boot: Arc<Booter>,
    ) -> std::io::Result<UdpGateway> {
        let sock = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(UdpGateway {
            sock: Arc::new(sock),
            groups: Arc::new(GroupMap::default()),
            recv_tx,
            boot,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Start the transmitter task and run the receive loop.  Returns when
    /// the hub side closes the receive channel.
    pub async fn run(self, xmit_rx: mpsc::Receiver<RFMessage>) {
        let sock = Arc::clone(&self.sock);
        let groups = Arc::clone(&self.groups);
        tokio::spawn(transmitter(sock, groups, xmit_rx));
        self.receiver().await;
    }

    async fn receiver(&self) {
        let mut buf = [0u8; 1600];
        loop {
            let (len, src) = match self.sock.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "UDP read error");
                    continue;
                }
            };
            if len < MIN_PACKET {
                info!(len, %src, "dropping short packet");
                continue;
            }
            if len > MAX_PACKET {
                info!(len, %src, "dropping long packet");
                continue;
            }
            let flags = buf[0];
            let group = buf[1];
            let node = buf[2];
            let payload = &buf[3..len];

            self.groups.save(group, src);

            match flags {
                FLAG_PAIRING => self.handle_pairing(src, group, node, payload).await,
                FLAG_BOOT_REQ => self.handle_boot(src, group, node, payload).await,
                FLAG_GW_LOG => {
                    info!(group, "UDP-GW: {}", String::from_utf8_lossy(payload));
                    let mut data = b"GW ".to_vec();
                    data.extend_from_slice(payload);
                    let m = RFMessage {
                        at: now_ms(),
                        group,
                        node,
                        kind: LOG_KIND,
                        data,
                        ..Default::default()
                    };
                    if self.recv_tx.send(m).await.is_err() {
                        return;
                    }
                }
                FLAG_BCAST_PUSH | FLAG_BCAST_REQ => {
                    let mut m =
                        RFMessage { at: now_ms(), group, node, ..Default::default() };
                    if node == 31 && payload.len() % 2 == 0 {
                        // early UDP gateway nodes self-report without a
                        // kind byte; keep the parity check bit-compatible
                        m.kind = GW_REPORT_KIND;
                        m.data = payload.to_vec();
                    } else if !payload.is_empty() {
                        m.kind = payload[0];
                        m.data = payload[1..].to_vec();
                    }
                    debug!(tag = %m.tag(), len, "UDP recv: {}", m.describe());
                    // the gateway wants the ACK before anything observes
                    // the message
                    if flags & 1 != 0 {
                        self.send_packet(group, node, FLAG_ACK, &[]).await;
                    }
                    if self.recv_tx.send(m).await.is_err() {
                        return;
                    }
                }
                other => {
                    info!(flags = other, group, node, len, "dropping packet with unknown flags");
                }
            }
        }
    }

    async fn handle_pairing(&self, src: SocketAddr, group: u8, node: u8, payload: &[u8]) {
        info!(%src, len = payload.len(), "UDP recv boot pairing");
        if payload.len() != PairingRequest::LEN {
            warn!(len = payload.len(), expect = PairingRequest::LEN, "bad pairing request length");
            return;
        }
        let req = match PairingRequest::decode(payload) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "cannot decode pairing request");
                return;
            }
        };
        let reply = self.boot.pair(&req);
        self.send_packet(group, node, FLAG_PAIRING, &reply.encode()).await;
    }

    async fn handle_boot(&self, src: SocketAddr, group: u8, node: u8, payload: &[u8]) {
        match payload.len() {
            UpgradeRequest::LEN => {
                info!(%src, "UDP recv boot upgrade");
                let Ok(req) = UpgradeRequest::decode(payload) else { return };
                if let Some(reply) = self.boot.upgrade(&req) {
                    self.send_packet(group, node, FLAG_BOOT_REPLY, &reply.encode()).await;
                }
            }
            DownloadRequest::LEN => {
                info!(%src, "UDP recv boot download");
                let Ok(req) = DownloadRequest::decode(payload) else { return };
                if let Some(reply) = self.boot.download(&req) {
                    self.send_packet(group, node, FLAG_BOOT_REPLY, &reply.encode()).await;
                }
            }
            other => warn!(len = other, "bad boot request length"),
        }
    }

    async fn send_packet(&self, group: u8, node: u8, flags: u8, data: &[u8]) {
        send_packet(&self.sock, &self.groups, group, node, flags, data).await;
    }
}

/// Drain the transmit queue: prepend the kind byte and ship each message
/// to its group's gateway.
async fn transmitter(
    sock: Arc<UdpSocket>,
    groups: Arc<GroupMap>,
    mut xmit_rx: mpsc::Receiver<RFMessage>,
) {
    while let Some(m) = xmit_rx.recv().await {
        let flags = if m.node == 0 { FLAG_BCAST_PUSH } else { FLAG_DATA_REQ };
        let mut data = Vec::with_capacity(m.data.len() + 1);
        data.push(m.kind);
        data.extend_from_slice(&m.data);
        send_packet(&sock, &groups, m.group, m.node, flags, &data).await;
    }
}

async fn send_packet(
    sock: &UdpSocket,
    groups: &GroupMap,
    group: u8,
    node: u8,
    flags: u8,
    data: &[u8],
) {
    let Some(addr) = groups.lookup(group) else {
        warn!(group, "no gateway known for RF group");
        return;
    };
    let mut buf = Vec::with_capacity(data.len() + 3);
    buf.push(flags);
    buf.push(group);
    buf.push(node);
    buf.extend_from_slice(data);
    info!(group, node, len = buf.len(), "UDP send");
    if let Err(e) = sock.send_to(&buf, addr).await {
        warn!(%addr, error = %e, "UDP send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wd_boot::SketchRepo;

    const CONFIG: &str = r#"
{ "00000000000000000000000000000000": [100, 252, 2] }
{ "100": "node.hex" }
"#;

    struct Rig {
        gw_addr: SocketAddr,
        node: UdpSocket,
        recv_rx: mpsc::Receiver<RFMessage>,
        xmit_tx: mpsc::Sender<RFMessage>,
        _dir: tempfile::TempDir,
    }

    async fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sketches.json"), CONFIG).unwrap();
        // 32 bytes of recognizable firmware
        let data: Vec<u8> = (0u8..32).collect();
        let mut hex_text = String::new();
        for (i, chunk) in data.chunks(16).enumerate() {
            hex_text.push_str(&record((i * 16) as u16, chunk));
            hex_text.push('\n');
        }
        std::fs::write(dir.path().join("node.hex"), hex_text).unwrap();
        let repo = SketchRepo::open(dir.path().join("sketches.json")).unwrap();
        let boot = Arc::new(Booter::new(repo));

        let (recv_tx, recv_rx) = mpsc::channel(10);
        let (xmit_tx, xmit_rx) = mpsc::channel(10);
        let gw = UdpGateway::bind(0, recv_tx, boot).await.unwrap();
        let gw_addr = SocketAddr::from(([127, 0, 0, 1], gw.local_addr().unwrap().port()));
        tokio::spawn(gw.run(xmit_rx));

        let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Rig { gw_addr, node, recv_rx, xmit_tx, _dir: dir }
    }

    fn record(addr: u16, data: &[u8]) -> String {
        let mut b = vec![data.len() as u8, (addr >> 8) as u8, addr as u8, 0x00];
        b.extend_from_slice(data);
        let sum: u8 = b.iter().fold(0u8, |acc, &v| acc.wrapping_add(v));
        b.push(sum.wrapping_neg());
        format!(":{}", hex::encode_upper(&b))
    }

    async fn recv_udp(sock: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .expect("timed out waiting for UDP packet")
            .unwrap();
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn data_packet_with_ack_bit_is_acked_then_forwarded() {
        let mut r = rig().await;
        // flags 1, group 212, node 5, kind 4, one data byte
        r.node.send_to(&[1, 212, 5, 4, 68], r.gw_addr).await.unwrap();

        let ack = recv_udp(&r.node).await;
        assert_eq!(ack, vec![FLAG_ACK, 212, 5]);

        let m = r.recv_rx.recv().await.unwrap();
        assert_eq!((m.group, m.node, m.kind), (212, 5, 4));
        assert_eq!(m.data, vec![68]);
        assert!(m.at > 0);
    }

    #[tokio::test]
    async fn broadcast_data_without_ack_bit_is_just_forwarded() {
        let mut r = rig().await;
        r.node.send_to(&[0, 212, 6, 7, 1, 2, 3, 4], r.gw_addr).await.unwrap();
        let m = r.recv_rx.recv().await.unwrap();
        assert_eq!((m.kind, m.data.len()), (7, 4));
    }

    #[tokio::test]
    async fn node_31_even_payload_is_a_gateway_self_report() {
        let mut r = rig().await;
        r.node.send_to(&[0, 212, 31, 9, 8, 7, 6], r.gw_addr).await.unwrap();
        let m = r.recv_rx.recv().await.unwrap();
        assert_eq!(m.kind, GW_REPORT_KIND);
        assert_eq!(m.data, vec![9, 8, 7, 6]);

        // odd payload parses normally
        r.node.send_to(&[0, 212, 31, 9, 8, 7], r.gw_addr).await.unwrap();
        let m = r.recv_rx.recv().await.unwrap();
        assert_eq!(m.kind, 9);
        assert_eq!(m.data, vec![8, 7]);
    }

    #[tokio::test]
    async fn gateway_log_packet_becomes_a_log_message() {
        let mut r = rig().await;
        let mut pkt = vec![FLAG_GW_LOG, 212, 31];
        pkt.extend_from_slice(b"hello");
        r.node.send_to(&pkt, r.gw_addr).await.unwrap();
        let m = r.recv_rx.recv().await.unwrap();
        assert_eq!(m.kind, LOG_KIND);
        assert_eq!(m.data, b"GW hello");
    }

    #[tokio::test]
    async fn short_long_and_unknown_flag_packets_are_dropped() {
        let mut r = rig().await;
        r.node.send_to(&[1, 2], r.gw_addr).await.unwrap();
        r.node.send_to(&vec![0u8; 70], r.gw_addr).await.unwrap();
        r.node.send_to(&[4, 212, 5, 1], r.gw_addr).await.unwrap();
        r.node.send_to(&[15, 212, 5, 1], r.gw_addr).await.unwrap();
        // a good packet after the bad ones still arrives, nothing else
        r.node.send_to(&[0, 212, 5, 42], r.gw_addr).await.unwrap();
        let m = r.recv_rx.recv().await.unwrap();
        assert_eq!(m.kind, 42);
        assert!(r.recv_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pairing_request_gets_a_pairing_reply() {
        let r = rig().await;
        let req = PairingRequest { node_type: 0, group_id: 0, node_id: 0, check: 0, hw_id: [0; 16] };
        let mut pkt = vec![FLAG_PAIRING, 212, 1];
        pkt.extend_from_slice(&req.encode());
        r.node.send_to(&pkt, r.gw_addr).await.unwrap();

        let reply = recv_udp(&r.node).await;
        assert_eq!(&reply[..3], &[FLAG_PAIRING, 212, 1]);
        let pr = wd_boot::PairingReply::decode(&reply[3..]).unwrap();
        assert_eq!((pr.node_type, pr.group_id, pr.node_id), (100, 252, 2));
        assert!(pr.sh_key[..8].iter().any(|&b| b != 0));
    }

    #[tokio::test]
    async fn upgrade_and_download_roundtrip() {
        let r = rig().await;
        let req = UpgradeRequest { node_type: 100, sw_id: 55, sw_size: 1024, sw_check: 0 };
        let mut pkt = vec![FLAG_BOOT_REQ, 212, 2];
        pkt.extend_from_slice(&req.encode());
        r.node.send_to(&pkt, r.gw_addr).await.unwrap();

        let reply = recv_udp(&r.node).await;
        assert_eq!(&reply[..3], &[FLAG_BOOT_REPLY, 212, 2]);
        let ur = wd_boot::UpgradeReply::decode(&reply[3..]).unwrap();
        assert_eq!((ur.node_type, ur.sw_id, ur.sw_size), (100, 100, 2));

        let dreq = DownloadRequest { sw_id: 100, sw_index: 0 };
        let mut pkt = vec![FLAG_BOOT_REQ, 212, 2];
        pkt.extend_from_slice(&dreq.encode());
        r.node.send_to(&pkt, r.gw_addr).await.unwrap();

        let reply = recv_udp(&r.node).await;
        let dr = wd_boot::DownloadReply::decode(&reply[3..]).unwrap();
        assert_eq!(dr.sw_id_xor_ix, 100);
        let mut data = dr.data;
        wd_boot::dewhiten(&mut data[..32]);
        let expect: Vec<u8> = (0u8..32).collect();
        assert_eq!(&data[..32], &expect[..]);
    }

    #[tokio::test]
    async fn transmitter_routes_by_learned_group_address() {
        let mut r = rig().await;
        // teach the gateway our address for group 212
        r.node.send_to(&[0, 212, 5, 1], r.gw_addr).await.unwrap();
        let _ = r.recv_rx.recv().await.unwrap();

        r.xmit_tx
            .send(RFMessage { group: 212, node: 9, kind: 5, data: vec![1, 2], ..Default::default() })
            .await
            .unwrap();
        let pkt = recv_udp(&r.node).await;
        assert_eq!(pkt, vec![FLAG_DATA_REQ, 212, 9, 5, 1, 2]);

        // broadcast uses flags 0
        r.xmit_tx
            .send(RFMessage { group: 212, node: 0, kind: 5, data: vec![], ..Default::default() })
            .await
            .unwrap();
        let pkt = recv_udp(&r.node).await;
        assert_eq!(pkt, vec![FLAG_BCAST_PUSH, 212, 0, 5]);
    }
}
