use log::{debug, warn};
use serde_json::{Map, Value};

use crate::{
    error::FrameError,
    frame::{
        self, ExtStats, FullStatsFrame, ValveReport, MAX_JSON_LEN, MAX_SECURE_BODY_LEN,
        SECURE_STATS_TYPE,
    },
    nvstore::layout::{DEVICE_ID_LEN, SECRET_KEY_LEN},
    radio::SecureFrameEncoder,
    sensors::is_valid_temp_c16,
    types::StatsTxLevel,
};

pub const KEY_ID: &str = "@";
pub const KEY_SEQ: &str = "+";

#[derive(Debug, Clone)]
struct StatsItem {
    key: &'static str,
    value: i64,
    changed: bool,
    sensitive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SimpleStatsRotation {
    items: Vec<StatsItem>,
    seq: u8,
    next_unchanged: usize,
}

impl SimpleStatsRotation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &'static str, value: i64, sensitive: bool) {
        match self.items.iter_mut().find(|item| item.key == key) {
            Some(item) => {
                item.changed |= item.value != value;
                item.value = value;
                item.sensitive = sensitive;
            }
            None => self.items.push(StatsItem {
                key,
                value,
                changed: true,
                sensitive,
            }),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.items.retain(|item| item.key != key);
        self.next_unchanged = 0;
    }

    pub fn any_changed(&self) -> bool {
        self.items.iter().any(|item| item.changed)
    }

    pub fn snapshot(&self, allow_sensitive: bool) -> Value {
        let map: Map<String, Value> = self
            .items
            .iter()
            .filter(|item| allow_sensitive || !item.sensitive)
            .map(|item| (item.key.to_string(), Value::from(item.value)))
            .collect();
        Value::Object(map)
    }

    /// Lays out the next JSON object no longer than `max_len` bytes, changed
    /// values first. Nothing is marked as sent until the batch is committed.
    pub fn prepare_json(&self, max_len: usize, allow_sensitive: bool, id: Option<&str>) -> JsonBatch {
        let mut map = Map::new();
        if let Some(id) = id {
            map.insert(KEY_ID.to_string(), Value::from(id));
        }
        map.insert(KEY_SEQ.to_string(), Value::from(self.seq));

        let eligible: Vec<usize> = (0..self.items.len())
            .filter(|i| allow_sensitive || !self.items[*i].sensitive)
            .collect();
        let n = self.items.len();
        let start = self.next_unchanged % n.max(1);
        let (changed, mut unchanged): (Vec<usize>, Vec<usize>) =
            eligible.into_iter().partition(|i| self.items[*i].changed);
        unchanged.sort_by_key(|i| (i + n - start) % n);
        let order = changed.into_iter().chain(unchanged);

        let mut batch = JsonBatch {
            json: Value::Object(map.clone()).to_string(),
            sent: Vec::new(),
            next_unchanged: self.next_unchanged,
        };
        for index in order {
            let item = &self.items[index];
            map.insert(item.key.to_string(), Value::from(item.value));
            let candidate = Value::Object(map.clone()).to_string();
            if candidate.len() > max_len {
                map.remove(item.key);
                break;
            }
            batch.json = candidate;
            batch.sent.push((item.key, item.value));
            if !item.changed {
                batch.next_unchanged = index + 1;
            }
        }
        batch
    }

    pub fn commit(&mut self, batch: JsonBatch) {
        self.seq = (self.seq + 1) & 0x0f;
        self.next_unchanged = batch.next_unchanged;
        for (key, value) in batch.sent {
            // A value that moved since the batch was laid out is still news.
            if let Some(item) = self.items.iter_mut().find(|item| item.key == key && item.value == value) {
                item.changed = false;
            }
        }
    }

    pub fn write_json(&mut self, max_len: usize, allow_sensitive: bool, id: Option<&str>) -> String {
        let batch = self.prepare_json(max_len, allow_sensitive, id);
        let json = batch.json.clone();
        self.commit(batch);
        json
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct JsonBatch {
    json: String,
    sent: Vec<(&'static str, i64)>,
    next_unchanged: usize,
}

impl JsonBatch {
    pub fn json(&self) -> &str {
        &self.json
    }
}

/// A complete stats frame. JSON frames hold their rotation batch until
/// [`StatsFrame::sent`] is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsFrame {
    pub bytes: Vec<u8>,
    batch: Option<JsonBatch>,
}

impl StatsFrame {
    pub fn sent(self, rotation: &mut SimpleStatsRotation) {
        if let Some(batch) = self.batch {
            rotation.commit(batch);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub short_id: u16,
    pub temp_c16: i16,
    pub valve: Option<ValveReport>,
    pub battery_low: bool,
    pub occupancy: u8,
    pub light: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsTxPolicy {
    pub level: StatsTxLevel,
    pub secure: bool,
    pub binary: bool,
    pub fs20_carrier: bool,
}

impl StatsTxPolicy {
    pub fn allows_sensitive(&self) -> bool {
        self.secure || self.level.allows_sensitive_insecure()
    }

    fn check(&self) -> Result<(), FrameError> {
        if !self.level.allows_any_tx() || (!self.secure && !self.level.allows_insecure()) {
            return Err(FrameError::NotPermitted);
        }
        Ok(())
    }
}

pub struct SecureContext<'a> {
    pub encoder: &'a mut dyn SecureFrameEncoder,
    pub key: Option<[u8; SECRET_KEY_LEN]>,
    pub device_id: [u8; DEVICE_ID_LEN],
}

/// Builds one complete stats frame, or fails without producing anything.
///
/// Secure frames omit the plaintext ID since the envelope carries it.
pub fn build_stats_frame(
    snapshot: &StatsSnapshot,
    rotation: &SimpleStatsRotation,
    policy: StatsTxPolicy,
    secure: Option<SecureContext<'_>>,
) -> Result<StatsFrame, FrameError> {
    policy.check()?;
    let sensitive = policy.allows_sensitive();

    if policy.secure {
        let ctx = secure.ok_or(FrameError::Encrypt)?;
        let key = ctx.key.ok_or(FrameError::MissingKey)?;
        let batch = rotation.prepare_json(MAX_SECURE_BODY_LEN, sensitive, None);
        let sealed = ctx
            .encoder
            .encode(&key, &ctx.device_id, SECURE_STATS_TYPE, batch.json().as_bytes())?;
        return match sealed.first() {
            Some(b) if b & 0x80 != 0 => Ok(StatsFrame {
                bytes: sealed,
                batch: Some(batch),
            }),
            _ => {
                warn!("secure encoder produced an unmarked frame");
                Err(FrameError::Encrypt)
            }
        };
    }

    let (frame, batch) = if policy.binary {
        let frame = FullStatsFrame {
            id: Some(snapshot.short_id),
            temp_c16: is_valid_temp_c16(snapshot.temp_c16).then_some(snapshot.temp_c16),
            valve: snapshot.valve,
            ext: sensitive.then(|| ExtStats {
                battery_low: snapshot.battery_low,
                occupancy: snapshot.occupancy,
                light: snapshot.light.unwrap_or(0),
            }),
        };
        (frame.encode(), None)
    } else {
        let id = format!("{:04x}", snapshot.short_id);
        let batch = rotation.prepare_json(MAX_JSON_LEN, sensitive, Some(&id));
        (frame::frame_json(batch.json())?, Some(batch))
    };
    debug!("stats frame {} bytes", frame.len());
    Ok(StatsFrame {
        bytes: frame::with_carrier_prefix(frame, policy.fs20_carrier),
        batch,
    })
}
