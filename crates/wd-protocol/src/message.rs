//! Canonical RF frame and sensor records.
//!
//! Serialized with MsgPack using the field names below; the encoding is
//! shared by the persistent store and the RPC wire, so renames are breaking.

use serde::{Deserialize, Serialize};

/// One RF frame, as received from or destined to a gateway.
///
/// Created on ingress (or by a client send request), timestamped by the
/// store when `at` is zero, stored once, fanned out, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RFMessage {
    /// Milliseconds since the Unix epoch; 0 on ingress means "stamp now"
    /// when stored.
    pub at: i64,
    /// RF network group, 1..=250.
    pub group: u8,
    /// RF node ID, 0..=31; 0 is broadcast.
    pub node: u8,
    /// Transmit with ACK requested.
    pub do_ack: bool,
    /// Module ID: the first payload byte of the RF packet.
    pub kind: u8,
    /// Remaining payload, at most 63 bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl RFMessage {
    /// Routing tag of this message, e.g. `RFg212i03k04`.
    pub fn tag(&self) -> String {
        format!("RFg{:03}i{:02}k{:02}", self.group, self.node, self.kind)
    }

    /// Render the payload for humans, decoding the well-known module kinds.
    pub fn describe(&self) -> String {
        match self.kind {
            2 => {
                // log line from a sketch
                let text = String::from_utf8_lossy(&self.data);
                format!("Log: {}", text.trim_end_matches('\n'))
            }
            4 => {
                let mut s = String::from("Temp:");
                for &t in &self.data {
                    s.push_str(&format!(" {t}F"));
                }
                s
            }
            7 => {
                if self.data.len() != 4 {
                    return format!("Water level: {} bytes? {}", self.data.len(), hex_dump(&self.data));
                }
                let v1 = f32::from(u16::from_le_bytes([self.data[0], self.data[1]])) * 3.3 / 1024.0;
                let v2 = f32::from(u16::from_le_bytes([self.data[2], self.data[3]])) * 3.3 / 1024.0;
                format!("Water levels: {v1:.3}V {v2:.3}V")
            }
            8 => {
                if self.data.len() < 4 {
                    return format!("RF RSSI {} bytes? {}", self.data.len(), hex_dump(&self.data));
                }
                let mut s = format!(
                    "RF: {}s/{}r Eth: {}s/{}r",
                    self.data[0], self.data[1], self.data[2], self.data[3]
                );
                let mut i = 4;
                while i + 1 < self.data.len() {
                    if self.data[i] != 0 || self.data[i + 1] != 0 {
                        s.push_str(&format!(" i{}:{}/{}", i, self.data[i], self.data[i + 1]));
                    }
                    i += 2;
                }
                s
            }
            _ => format!("unknown: {}", hex_dump(&self.data)),
        }
    }
}

/// Space-separated lowercase hex bytes, as in the daily log files.
pub fn hex_dump(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            s.push(' ');
        }
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// One sample of one sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorDataValue {
    /// Milliseconds since the Unix epoch; 0 means "stamp now" on store.
    pub at: i64,
    pub value: f64,
}

/// Static metadata of one sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorInfo {
    pub unit: String,
    /// True when stored values are monotonically increasing counters whose
    /// derivative is the sensor reading.
    pub rate: bool,
}
