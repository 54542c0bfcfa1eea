use std::fmt::Write as _;

use log::{debug, info};

use crate::{
    nvstore::{layout, NvStore, ERASED_BYTE},
    rng::Rng8,
    sensors::is_valid_temp_c16,
};

pub const STATS_UNSET: u8 = ERASED_BYTE;
pub const COMPRESSED_TEMP_MAX: u8 = 248;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSet {
    Temp = 0,
    TempSmoothed = 1,
    Light = 2,
    LightSmoothed = 3,
    OccPc = 4,
    OccPcSmoothed = 5,
    RhPc = 6,
    RhPcSmoothed = 7,
}

impl StatsSet {
    pub const ALL: [StatsSet; layout::STATS_SETS] = [
        Self::Temp,
        Self::TempSmoothed,
        Self::Light,
        Self::LightSmoothed,
        Self::OccPc,
        Self::OccPcSmoothed,
        Self::RhPc,
        Self::RhPcSmoothed,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    fn addr(self, hour: u8) -> usize {
        layout::STATS + (self as usize) * layout::STATS_SET_LEN + usize::from(hour % 24)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsHour {
    Current,
    Next,
    At(u8),
}

impl StatsHour {
    pub fn resolve(self, current_hour: u8) -> u8 {
        match self {
            Self::Current => current_hour % 24,
            Self::Next => (current_hour + 1) % 24,
            Self::At(hour) => hour % 24,
        }
    }
}

pub fn compress_temp_c16(temp_c16: i16) -> u8 {
    match temp_c16 {
        t if t <= 0 => 0,
        t if t < 16 << 4 => (t >> 3) as u8,
        t if t < 24 << 4 => (32 + ((t - (16 << 4)) >> 1)) as u8,
        t if t < 100 << 4 => (96 + ((t - (24 << 4)) >> 3)) as u8,
        _ => COMPRESSED_TEMP_MAX,
    }
}

pub fn expand_temp_c16(compressed: u8) -> Option<i16> {
    let c = i16::from(compressed);
    match compressed {
        0..=31 => Some(c << 3),
        32..=95 => Some((16 << 4) + ((c - 32) << 1)),
        96..=247 => Some((24 << 4) + ((c - 96) << 3)),
        COMPRESSED_TEMP_MAX => Some(100 << 4),
        _ => None,
    }
}

/// Exponential smoothing with 1/8 weight on the new value and stochastic
/// rounding so that small steady differences are not lost.
pub fn smooth_stats_value(old: u8, new: u8, rng: &mut Rng8) -> u8 {
    let acc = u16::from(old) * 7 + u16::from(new) + u16::from(rng.next_u8() & 7);
    (acc >> 3) as u8
}

pub fn get(nv: &impl NvStore, set: StatsSet, hour: StatsHour, current_hour: u8) -> Option<u8> {
    match nv.read_byte(set.addr(hour.resolve(current_hour))) {
        STATS_UNSET => None,
        value => Some(value),
    }
}

pub fn min_max(nv: &impl NvStore, set: StatsSet) -> (Option<u8>, Option<u8>) {
    let values = (0..24).filter_map(|h| get(nv, set, StatsHour::At(h), 0));
    values.fold((None, None), |(min, max), v| {
        (
            Some(min.map_or(v, |m: u8| m.min(v))),
            Some(max.map_or(v, |m: u8| m.max(v))),
        )
    })
}

pub fn zap(nv: &mut impl NvStore) -> bool {
    let mut changed = false;
    for set in StatsSet::ALL {
        for hour in 0..24 {
            changed |= nv.erase_byte(set.addr(hour));
        }
    }
    if changed {
        info!("stats zapped");
    }
    changed
}

pub fn dump(nv: &impl NvStore, set: StatsSet, current_hour: u8) -> String {
    let mut line = format!(">D{}", set as u8);
    for hour in 0..24 {
        let mark = if hour == current_hour % 24 { "*" } else { " " };
        match get(nv, set, StatsHour::At(hour), current_hour) {
            Some(value) => {
                let _ = write!(line, "{mark}{value}");
            }
            None => {
                let _ = write!(line, "{mark}-");
            }
        }
    }
    line
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReading {
    pub temp_c16: i16,
    pub light: Option<u8>,
    pub occupancy_pc: u8,
    pub rh_pc: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    sum: u32,
    count: u16,
}

impl Accumulator {
    fn add(&mut self, value: u32) {
        self.sum += value;
        self.count += 1;
    }

    fn take_mean(&mut self) -> Option<u32> {
        let mean = (self.count > 0).then(|| (self.sum + u32::from(self.count) / 2) / u32::from(self.count));
        *self = Self::default();
        mean
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsSampler {
    temp: Accumulator,
    light: Accumulator,
    occupancy: Accumulator,
    rh: Accumulator,
}

impl StatsSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(
        &mut self,
        nv: &mut impl NvStore,
        reading: &StatsReading,
        full_sample: bool,
        hour: u8,
        rng: &mut Rng8,
    ) {
        if is_valid_temp_c16(reading.temp_c16) {
            self.temp.add(u32::from(compress_temp_c16(reading.temp_c16)));
        }
        if let Some(light) = reading.light {
            self.light.add(u32::from(light));
        }
        self.occupancy.add(u32::from(reading.occupancy_pc.min(100)));
        if let Some(rh) = reading.rh_pc {
            self.rh.add(u32::from(rh.min(100)));
        }
        if !full_sample {
            return;
        }

        let hour = hour % 24;
        let means = [
            (StatsSet::Temp, StatsSet::TempSmoothed, self.temp.take_mean()),
            (StatsSet::Light, StatsSet::LightSmoothed, self.light.take_mean()),
            (StatsSet::OccPc, StatsSet::OccPcSmoothed, self.occupancy.take_mean()),
            (StatsSet::RhPc, StatsSet::RhPcSmoothed, self.rh.take_mean()),
        ];
        for (last_set, smoothed_set, mean) in means {
            let Some(mean) = mean else { continue };
            let value = mean.min(u32::from(STATS_UNSET - 1)) as u8;
            nv.write_if_changed(last_set.addr(hour), value);
            let smoothed = match nv.read_byte(smoothed_set.addr(hour)) {
                STATS_UNSET => value,
                old => smooth_stats_value(old, value, rng),
            };
            nv.write_if_changed(smoothed_set.addr(hour), smoothed);
        }
        debug!("stats sampled for hour {hour}");
    }
}
