//! RF message and sensor time-series persistence.
//!
//! Key schemes over the typed store:
//! - `raw/<at:013>`            -> RFMessage
//! - `sens/<name>/<at:013>`    -> SensorDataValue
//! - `sensinfo/<name>`         -> SensorInfo
//!
//! Writers stamp messages whose `at` is zero, persist them, then publish to
//! the matching topic so subscribers see exactly the stored record.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::error;

use wd_protocol::{RFMessage, SensorDataValue, SensorInfo};

use crate::pubsub::{ReplayFn, SensorTopics, SubId, Subscription, Topic};
use crate::store::{Kv, Store, StoreError};

const RF_PREFIX: &str = "raw/";
const SENSOR_PREFIX: &str = "sens/";
const SENSOR_INFO_PREFIX: &str = "sensinfo/";

/// Largest timestamp a 13-digit key can carry.  A wider value would
/// format to more digits and sort lexicographically *before* real keys.
const MAX_AT: i64 = 9_999_999_999_999;

/// Key of an RF message stored at `at`.
pub fn gen_rf_key(at: i64) -> String {
    format!("{RF_PREFIX}{at:013}")
}

/// Inverse of [`gen_rf_key`].
pub fn parse_rf_key(key: &str) -> Result<i64, StoreError> {
    key.strip_prefix(RF_PREFIX)
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| StoreError::BadKey(key.to_string()))
}

/// Exclusive upper key for an RF range ending at `end`; `end <= 0` means
/// unbounded and yields a bound one character past [`MAX_AT`]'s key.
fn rf_end_key(end: i64) -> String {
    if end > 0 {
        gen_rf_key(end)
    } else {
        let mut key = gen_rf_key(MAX_AT);
        key.push('0');
        key
    }
}

fn gen_sensor_key(name: &str, at: i64) -> String {
    format!("{SENSOR_PREFIX}{name}/{at:013}")
}

/// Sensor counterpart of [`rf_end_key`].
fn sensor_end_key(name: &str, end: i64) -> String {
    if end > 0 {
        gen_sensor_key(name, end)
    } else {
        let mut key = gen_sensor_key(name, MAX_AT);
        key.push('0');
        key
    }
}

fn gen_sensor_info_key(name: &str) -> String {
    format!("{SENSOR_INFO_PREFIX}{name}")
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The hub's database: typed store plus the RF and per-sensor topics.
pub struct HubDb {
    store: Arc<Store>,
    rf: Topic<RFMessage>,
    sensors: SensorTopics,
}

impl HubDb {
    pub fn new(kv: Box<dyn Kv>) -> Self {
        HubDb {
            store: Arc::new(Store::new(kv)),
            rf: Topic::new("rf"),
            sensors: SensorTopics::new(),
        }
    }

    // -----------------------------------------------------------------------
    // RF messages
    // -----------------------------------------------------------------------

    /// Stamp (if needed), persist, and publish one RF message.
    pub async fn put_rf_message(&self, mut m: RFMessage) -> Result<(), StoreError> {
        if m.at == 0 {
            m.at = now_ms();
        }
        self.store.put(&gen_rf_key(m.at), Some(&m))?;
        self.rf.publish(&m).await;
        Ok(())
    }

    /// Iterate stored RF messages with `start <= at < end`; `end == 0`
    /// means unbounded.
    pub fn rf_iterate<F>(&self, start: i64, end: i64, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(RFMessage) -> Result<(), StoreError>,
    {
        self.store.iterate(&gen_rf_key(start), &rf_end_key(end), |_, m: RFMessage| f(m))
    }

    /// One ordered batch of stored RF messages from `start` on.
    pub fn rf_scan(&self, start: i64, limit: usize) -> Result<Vec<RFMessage>, StoreError> {
        let batch = self.store.scan::<RFMessage>(&gen_rf_key(start), &rf_end_key(0), limit)?;
        Ok(batch.into_iter().map(|(_, m)| m).collect())
    }

    /// Subscribe to RF messages; history from `start_at` when positive.
    pub fn rf_subscribe(&self, start_at: i64) -> Subscription<RFMessage> {
        let store = Arc::clone(&self.store);
        let replay: Arc<ReplayFn<RFMessage>> = Arc::new(move |from, limit| {
            let batch = store.scan::<RFMessage>(&gen_rf_key(from), &rf_end_key(0), limit)?;
            Ok(batch.into_iter().map(|(_, m)| m).collect())
        });
        self.rf.subscribe(start_at, replay)
    }

    pub async fn rf_unsubscribe(&self, id: SubId) {
        self.rf.unsubscribe(id).await;
    }

    /// Drain a fan-out channel into the RF store; the standard receive
    /// processor registered at startup.
    pub fn spawn_rf_writer(self: &Arc<Self>, mut rx: mpsc::Receiver<RFMessage>) {
        let db = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(m) = rx.recv().await {
                if let Err(e) = db.put_rf_message(m).await {
                    error!(error = %e, "error writing database");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Sensors
    // -----------------------------------------------------------------------

    /// Stamp (if needed), persist, and publish one sensor sample.
    pub async fn put_sensor_value(
        &self,
        name: &str,
        mut v: SensorDataValue,
    ) -> Result<(), StoreError> {
        if v.at == 0 {
            v.at = now_ms();
        }
        self.store.put(&gen_sensor_key(name, v.at), Some(&v))?;
        self.sensors.publish(name, &v).await;
        Ok(())
    }

    /// Iterate one sensor's samples with `start <= at < end`; `end == 0`
    /// means unbounded.
    pub fn sensor_iterate<F>(
        &self,
        name: &str,
        start: i64,
        end: i64,
        mut f: F,
    ) -> Result<(), StoreError>
    where
        F: FnMut(SensorDataValue) -> Result<(), StoreError>,
    {
        let end_key = sensor_end_key(name, end);
        self.store.iterate(&gen_sensor_key(name, start), &end_key, |_, v: SensorDataValue| f(v))
    }

    /// Collect one sensor's samples with `start <= at < end` (bounded).
    pub fn sensor_scan(
        &self,
        name: &str,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<SensorDataValue>, StoreError> {
        let end_key = sensor_end_key(name, end);
        let batch = self.store.scan::<SensorDataValue>(&gen_sensor_key(name, start), &end_key, limit)?;
        Ok(batch.into_iter().map(|(_, v)| v).collect())
    }

    /// Subscribe to one sensor; history from `start_at` when positive.
    pub async fn sensor_subscribe(&self, name: &str, start_at: i64) -> Subscription<SensorDataValue> {
        let store = Arc::clone(&self.store);
        let name_owned = name.to_string();
        let replay: Arc<ReplayFn<SensorDataValue>> = Arc::new(move |from, limit| {
            let batch = store.scan::<SensorDataValue>(
                &gen_sensor_key(&name_owned, from),
                &sensor_end_key(&name_owned, 0),
                limit,
            )?;
            Ok(batch.into_iter().map(|(_, v)| v).collect())
        });
        self.sensors.topic(name).await.subscribe(start_at, replay)
    }

    pub async fn sensor_unsubscribe(&self, name: &str, id: SubId) {
        self.sensors.unsubscribe(name, id).await;
    }

    pub fn get_sensor_info(&self, name: &str) -> Result<SensorInfo, StoreError> {
        self.store.get(&gen_sensor_info_key(name))
    }

    pub fn put_sensor_info(&self, name: &str, info: &SensorInfo) -> Result<(), StoreError> {
        self.store.put(&gen_sensor_info_key(name), Some(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteKv;
    use std::time::Duration;

    fn db() -> Arc<HubDb> {
        Arc::new(HubDb::new(Box::new(SqliteKv::open_in_memory().unwrap())))
    }

    #[test]
    fn rf_key_roundtrips_across_the_timestamp_range() {
        for t in [0, 1, 999, 1_400_000_000_000, 9_999_999_999_999] {
            assert_eq!(parse_rf_key(&gen_rf_key(t)).unwrap(), t, "t={t}");
        }
        assert_eq!(gen_rf_key(42).len(), "raw/".len() + 13);
        assert!(parse_rf_key("raw/").is_err());
        assert!(parse_rf_key("sens/x/0000000000001").is_err());
    }

    #[tokio::test]
    async fn unbounded_ranges_cover_the_whole_timestamp_domain() {
        let db = db();
        // the top of the 13-digit key domain must not fall outside the
        // "unbounded" upper bound
        for at in [1i64, 9_300_000_000_000, 9_999_999_999_999] {
            db.put_rf_message(RFMessage { at, group: 1, ..Default::default() }).await.unwrap();
            db.put_sensor_value("edge", SensorDataValue { at, value: 1.0 }).await.unwrap();
        }

        let got = db.rf_scan(0, 10).unwrap();
        let ats: Vec<i64> = got.iter().map(|m| m.at).collect();
        assert_eq!(ats, vec![1, 9_300_000_000_000, 9_999_999_999_999]);

        let mut seen = Vec::new();
        db.rf_iterate(2, 0, |m| {
            seen.push(m.at);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![9_300_000_000_000, 9_999_999_999_999]);

        let got = db.sensor_scan("edge", 0, 0, 10).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[2].at, 9_999_999_999_999);

        // catch-up replay uses the same bound; nothing may be dropped
        let mut sub = db.rf_subscribe(1);
        for _ in 0..3 {
            let m = tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
                .await
                .expect("timed out")
                .expect("closed early");
            assert!(m.at > 0);
        }
    }

    #[tokio::test]
    async fn put_stamps_zero_timestamps() {
        let db = db();
        let before = now_ms();
        db.put_rf_message(RFMessage { group: 1, ..Default::default() }).await.unwrap();
        let got = db.rf_scan(0, 10).unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].at >= before, "stamped at {} < {}", got[0].at, before);
    }

    #[tokio::test]
    async fn rf_iterate_honors_range_and_unbounded_end() {
        let db = db();
        for i in 0..5i64 {
            db.put_rf_message(RFMessage { at: 100 + i, group: i as u8, ..Default::default() })
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        db.rf_iterate(101, 104, |m| {
            seen.push(m.at);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![101, 102, 103]);

        seen.clear();
        db.rf_iterate(103, 0, |m| {
            seen.push(m.at);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![103, 104]);
    }

    #[tokio::test]
    async fn sensor_values_and_info_roundtrip() {
        let db = db();
        assert!(matches!(db.get_sensor_info("kitchen/temp"), Err(StoreError::NotFound)));
        let info = SensorInfo { unit: "F".into(), rate: false };
        db.put_sensor_info("kitchen/temp", &info).unwrap();
        assert_eq!(db.get_sensor_info("kitchen/temp").unwrap(), info);

        for i in 0..3i64 {
            db.put_sensor_value("kitchen/temp", SensorDataValue { at: 50 + i, value: i as f64 })
                .await
                .unwrap();
        }
        // a second sensor must not leak into the first one's range
        db.put_sensor_value("kitchen/hum", SensorDataValue { at: 51, value: 9.0 }).await.unwrap();

        let got = db.sensor_scan("kitchen/temp", 0, 0, 100).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[1].at, 51);
        assert_eq!(got[1].value, 1.0);
    }

    #[tokio::test]
    async fn rf_subscribe_bridges_history_and_live_writes() {
        let db = db();
        let t = 1_400_000_000_000i64;
        for i in 0..10 {
            db.put_rf_message(RFMessage {
                at: t + i,
                group: (2 * i) as u8,
                node: 13,
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let mut sub = db.rf_subscribe(t + 4);
        for i in 10..20 {
            db.put_rf_message(RFMessage {
                at: t + i,
                group: (2 * i) as u8,
                node: 13,
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let mut groups = Vec::new();
        for _ in 0..16 {
            let m = tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
                .await
                .expect("timed out")
                .expect("closed early");
            groups.push(m.group);
        }
        let expect: Vec<u8> = (4..20).map(|i| (2 * i) as u8).collect();
        assert_eq!(groups, expect);
        db.rf_unsubscribe(sub.id).await;
        assert!(sub.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn sensor_subscribe_only_sees_its_sensor() {
        let db = db();
        let mut sub = db.sensor_subscribe("a", 1).await;
        db.put_sensor_value("b", SensorDataValue { at: 10, value: 1.0 }).await.unwrap();
        db.put_sensor_value("a", SensorDataValue { at: 11, value: 2.0 }).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
            .await
            .expect("timed out")
            .expect("closed early");
        assert_eq!((got.at, got.value), (11, 2.0));
    }
}
