//! Per-kind RF payload decoders.
//!
//! Turns the well-known module payloads into sensor readings stored under
//! `<tag>/<reading>` (e.g. `RFg212i03k04/temp`).  Unknown kinds pass
//! through untouched; kind 2 carries sketch log text and is only logged.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use wd_protocol::{RFMessage, SensorDataValue, SensorInfo};

use crate::db::HubDb;
use crate::store::StoreError;

struct Reading {
    name_suffix: &'static str,
    value: f64,
    unit: &'static str,
    rate: bool,
}

fn decode(m: &RFMessage) -> Vec<Reading> {
    match m.kind {
        4 => {
            // one-wire temperature: first payload byte, degrees F
            m.data
                .first()
                .map(|&t| Reading {
                    name_suffix: "temp",
                    value: f64::from(t),
                    unit: "F",
                    rate: false,
                })
                .into_iter()
                .collect()
        }
        7 => {
            // water level: two 10-bit ADC counts at 3.3V reference
            if m.data.len() != 4 {
                return Vec::new();
            }
            let v1 = f64::from(u16::from_le_bytes([m.data[0], m.data[1]])) * 3.3 / 1024.0;
            let v2 = f64::from(u16::from_le_bytes([m.data[2], m.data[3]])) * 3.3 / 1024.0;
            vec![
                Reading { name_suffix: "level0", value: v1, unit: "V", rate: false },
                Reading { name_suffix: "level1", value: v2, unit: "V", rate: false },
            ]
        }
        8 => {
            // gateway self-report: cumulative packet counters
            if m.data.len() < 4 {
                return Vec::new();
            }
            vec![
                Reading { name_suffix: "rf_sent", value: f64::from(m.data[0]), unit: "pkts", rate: true },
                Reading { name_suffix: "rf_recv", value: f64::from(m.data[1]), unit: "pkts", rate: true },
                Reading { name_suffix: "eth_sent", value: f64::from(m.data[2]), unit: "pkts", rate: true },
                Reading { name_suffix: "eth_recv", value: f64::from(m.data[3]), unit: "pkts", rate: true },
            ]
        }
        _ => Vec::new(),
    }
}

async fn process(db: &HubDb, m: &RFMessage) -> Result<(), StoreError> {
    if m.kind == 2 {
        let text = String::from_utf8_lossy(&m.data);
        info!(group = m.group, node = m.node, "LOG: {}", text.trim());
        return Ok(());
    }
    let tag = m.tag();
    for r in decode(m) {
        let name = format!("{tag}/{}", r.name_suffix);
        // first sighting registers the sensor's metadata
        if matches!(db.get_sensor_info(&name), Err(StoreError::NotFound)) {
            db.put_sensor_info(&name, &SensorInfo { unit: r.unit.into(), rate: r.rate })?;
        }
        db.put_sensor_value(&name, SensorDataValue { at: m.at, value: r.value }).await?;
    }
    Ok(())
}

/// Start the decoder processor on a fan-out channel.
pub fn spawn(mut rx: mpsc::Receiver<RFMessage>, db: Arc<HubDb>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(m) = rx.recv().await {
            if let Err(e) = process(&db, &m).await {
                warn!(tag = %m.tag(), error = %e, "decoder store write failed");
            }
        }
    })
}
