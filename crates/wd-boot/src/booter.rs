//! Boot protocol request handlers.
//!
//! Stateless beyond the [`SketchRepo`]: every handler looks the node up,
//! builds a reply, and leaves transport concerns (UDP framing, retries) to
//! the gateway.  Handlers that cannot produce a useful reply return `None`
//! and the node will retry.

use std::sync::Arc;

use rand::RngCore;
use tracing::{info, warn};

use crate::crc::crc16;
use crate::messages::{
    BOOT_DATA_MAX, DownloadReply, DownloadRequest, PairingReply, PairingRequest, UpgradeReply,
    UpgradeRequest, dewhiten,
};
use crate::repo::{PairingInfo, SketchRepo};

pub struct Booter {
    repo: Arc<SketchRepo>,
}

impl Booter {
    pub fn new(repo: Arc<SketchRepo>) -> Self {
        Booter { repo }
    }

    /// Answer a pairing request with the node's assigned identity.
    ///
    /// A node with an all-zero hardware ID gets 8 fresh random bytes in the
    /// reply's shared-key field; it adopts them as its hardware ID.  Unknown
    /// IDs fall back to the all-zero config entry, and a repository without
    /// even that replies with an all-zero assignment.
    pub fn pair(&self, req: &PairingRequest) -> PairingReply {
        let mut sh_key = [0u8; 16];
        let hw_id_hex = if req.hw_id.iter().all(|&b| b == 0) {
            rand::thread_rng().fill_bytes(&mut sh_key[..8]);
            let hw_id_hex = hex::encode(sh_key);
            info!(hw_id = %hw_id_hex, "assigned new hardware ID");
            hw_id_hex
        } else {
            hex::encode(req.hw_id)
        };

        let info = self.repo.pair_lookup(&hw_id_hex).unwrap_or_else(|| {
            warn!(hw_id = %hw_id_hex, "no pairing entry and no default assignment");
            PairingInfo::default()
        });

        info!(
            hw_id = %hw_id_hex,
            node_type = info.node_type,
            group = info.group_id,
            node = info.node_id,
            "pairing reply"
        );
        PairingReply {
            node_type: info.node_type,
            group_id: info.group_id,
            node_id: info.node_id,
            sh_key,
        }
    }

    /// Tell the node which software it should run, sized in 16-byte units
    /// and checksummed over the whole padded image.
    pub fn upgrade(&self, req: &UpgradeRequest) -> Option<UpgradeReply> {
        let sw = match self.repo.find_software(req.node_type) {
            Ok(sw) => sw,
            Err(e) => {
                warn!(node_type = req.node_type, error = %e, "cannot load sketch");
                return None;
            }
        };
        let reply = UpgradeReply {
            node_type: req.node_type,
            sw_id: req.node_type,
            sw_size: (sw.len() / 16) as u16,
            sw_check: crc16(&sw),
        };
        info!(node_type = req.node_type, sw_size = reply.sw_size, sw_check = reply.sw_check,
            "upgrade reply");
        Some(reply)
    }

    /// Serve one whitened 64-byte chunk of the requested software.
    pub fn download(&self, req: &DownloadRequest) -> Option<DownloadReply> {
        let sw = match self.repo.find_software(req.sw_id) {
            Ok(sw) => sw,
            Err(e) => {
                warn!(sw_id = req.sw_id, error = %e, "cannot load sketch");
                return None;
            }
        };
        let offset = req.sw_index as usize * BOOT_DATA_MAX;
        if offset >= sw.len() {
            warn!(sw_id = req.sw_id, ix = req.sw_index, offset, sw_len = sw.len(),
                "download request beyond end of software");
            return None;
        }
        let n = BOOT_DATA_MAX.min(sw.len() - offset);
        let mut data = [0u8; BOOT_DATA_MAX];
        data[..n].copy_from_slice(&sw[offset..offset + n]);
        dewhiten(&mut data[..n]);
        Some(DownloadReply { sw_id_xor_ix: req.sw_id ^ req.sw_index, data })
    }
}
