//! Packed wire formats of the boot protocol.
//!
//! All messages are fixed-size, little-endian and carried as the payload of
//! a UDP gateway packet.  Encode and decode are implemented for every
//! message so the hub, emulated nodes and tests can speak both directions.

/// Payload bytes per download chunk.
pub const BOOT_DATA_MAX: usize = 64;
/// Firmware images are padded to a multiple of this.
pub const BOOT_SIZE_ROUND: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("boot message too short: {got} bytes, need {need}")]
    Truncated { need: usize, got: usize },
}

fn check_len(b: &[u8], need: usize) -> Result<(), MessageError> {
    if b.len() < need {
        return Err(MessageError::Truncated { need, got: b.len() });
    }
    Ok(())
}

fn u16le(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

/// Sent by an unpaired (or re-pairing) node to obtain its RF identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingRequest {
    /// Type of the remote node, 100..999 freely available.
    pub node_type: u16,
    /// Current network group, 1..250 or 0 if unpaired.
    pub group_id: u8,
    /// Current node ID, 1..30 or 0 if unpaired.
    pub node_id: u8,
    /// CRC over the current shared key (unused).
    pub check: u16,
    /// Unique hardware ID, or all zero if the node has none yet.
    pub hw_id: [u8; 16],
}

impl PairingRequest {
    pub const LEN: usize = 22;

    pub fn decode(b: &[u8]) -> Result<Self, MessageError> {
        check_len(b, Self::LEN)?;
        let mut hw_id = [0u8; 16];
        hw_id.copy_from_slice(&b[6..22]);
        Ok(Self {
            node_type: u16le(b, 0),
            group_id: b[2],
            node_id: b[3],
            check: u16le(b, 4),
            hw_id,
        })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0..2].copy_from_slice(&self.node_type.to_le_bytes());
        b[2] = self.group_id;
        b[3] = self.node_id;
        b[4..6].copy_from_slice(&self.check.to_le_bytes());
        b[6..22].copy_from_slice(&self.hw_id);
        b
    }
}

/// Assignment returned for a pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingReply {
    pub node_type: u16,
    pub group_id: u8,
    pub node_id: u8,
    /// Shared key; the first 8 bytes double as a freshly assigned hardware
    /// ID when the request carried none.  All zero otherwise.
    pub sh_key: [u8; 16],
}

impl PairingReply {
    pub const LEN: usize = 20;

    pub fn decode(b: &[u8]) -> Result<Self, MessageError> {
        check_len(b, Self::LEN)?;
        let mut sh_key = [0u8; 16];
        sh_key.copy_from_slice(&b[4..20]);
        Ok(Self { node_type: u16le(b, 0), group_id: b[2], node_id: b[3], sh_key })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0..2].copy_from_slice(&self.node_type.to_le_bytes());
        b[2] = self.group_id;
        b[3] = self.node_id;
        b[4..20].copy_from_slice(&self.sh_key);
        b
    }
}

// ---------------------------------------------------------------------------
// Upgrade
// ---------------------------------------------------------------------------

/// Node asks which software it should be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub node_type: u16,
    /// Current software ID, or 0 if unknown.
    pub sw_id: u16,
    /// Current software size in units of 16 bytes.
    pub sw_size: u16,
    /// CRC over the node's current image.
    pub sw_check: u16,
}

/// The software the node should download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeReply {
    pub node_type: u16,
    pub sw_id: u16,
    /// Download size in units of 16 bytes.
    pub sw_size: u16,
    /// CRC over the entire download.
    pub sw_check: u16,
}

macro_rules! upgrade_codec {
    ($name:ident) => {
        impl $name {
            pub const LEN: usize = 8;

            pub fn decode(b: &[u8]) -> Result<Self, MessageError> {
                check_len(b, Self::LEN)?;
                Ok(Self {
                    node_type: u16le(b, 0),
                    sw_id: u16le(b, 2),
                    sw_size: u16le(b, 4),
                    sw_check: u16le(b, 6),
                })
            }

            pub fn encode(&self) -> [u8; Self::LEN] {
                let mut b = [0u8; Self::LEN];
                b[0..2].copy_from_slice(&self.node_type.to_le_bytes());
                b[2..4].copy_from_slice(&self.sw_id.to_le_bytes());
                b[4..6].copy_from_slice(&self.sw_size.to_le_bytes());
                b[6..8].copy_from_slice(&self.sw_check.to_le_bytes());
                b
            }
        }
    };
}

upgrade_codec!(UpgradeRequest);
upgrade_codec!(UpgradeReply);

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// Node requests one 64-byte chunk of its assigned software.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRequest {
    pub sw_id: u16,
    /// Chunk index, in multiples of [`BOOT_DATA_MAX`].
    pub sw_index: u16,
}

impl DownloadRequest {
    pub const LEN: usize = 4;

    pub fn decode(b: &[u8]) -> Result<Self, MessageError> {
        check_len(b, Self::LEN)?;
        Ok(Self { sw_id: u16le(b, 0), sw_index: u16le(b, 2) })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0..2].copy_from_slice(&self.sw_id.to_le_bytes());
        b[2..4].copy_from_slice(&self.sw_index.to_le_bytes());
        b
    }
}

/// One whitened chunk of software.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReply {
    /// `sw_id ^ sw_index` of the request, so the node can detect stale
    /// replies without a larger header.
    pub sw_id_xor_ix: u16,
    pub data: [u8; BOOT_DATA_MAX],
}

impl DownloadReply {
    pub const LEN: usize = 2 + BOOT_DATA_MAX;

    pub fn decode(b: &[u8]) -> Result<Self, MessageError> {
        check_len(b, Self::LEN)?;
        let mut data = [0u8; BOOT_DATA_MAX];
        data.copy_from_slice(&b[2..2 + BOOT_DATA_MAX]);
        Ok(Self { sw_id_xor_ix: u16le(b, 0), data })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut b = [0u8; Self::LEN];
        b[0..2].copy_from_slice(&self.sw_id_xor_ix.to_le_bytes());
        b[2..].copy_from_slice(&self.data);
        b
    }
}

// ---------------------------------------------------------------------------
// Whitening
// ---------------------------------------------------------------------------

/// XOR each byte with `(211 * index) mod 256`.
///
/// Prevents long runs of identical bits on the RF link.  The operation is
/// its own inverse, so it both whitens and de-whitens.
pub fn dewhiten(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= (211usize.wrapping_mul(i) & 0xFF) as u8;
    }
}
