use crate::{
    config::{TEMP_SCALE_MAX, TEMP_SCALE_MIN},
    types::ValveMode,
};

/// Temperature reading that could not be taken or was implausible.
pub const TEMP_C16_INVALID: i16 = i16::MIN;
pub const BYTE_SENSOR_INVALID: u8 = 0xff;

pub const BATTERY_LOW_CV: u16 = 245;
pub const BATTERY_CONSERVE_CV: u16 = 260;

const TEMP_C16_PLAUSIBLE: core::ops::RangeInclusive<i16> = (-40 * 16)..=(100 * 16);

/// Uniform contract over every sensor the loop samples.
///
/// `read` forces a fresh sample and caches it; `get` returns the cached value.
/// Failed or implausible reads return the sensor's sentinel instead of panicking.
pub trait Sensor {
    type Value: Copy;

    fn read(&mut self) -> Self::Value;

    fn get(&self) -> Self::Value;

    fn preferred_poll_interval_s(&self) -> u8 {
        60
    }

    fn tag(&self) -> &'static str;
}

pub type TemperatureSensor = Box<dyn Sensor<Value = i16> + Send>;
pub type ByteSensor = Box<dyn Sensor<Value = u8> + Send>;
pub type SupplySensor = Box<dyn Sensor<Value = u16> + Send>;

pub fn is_valid_temp_c16(temp_c16: i16) -> bool {
    TEMP_C16_PLAUSIBLE.contains(&temp_c16)
}

pub fn sanitize_temp_c16(temp_c16: i16) -> i16 {
    if is_valid_temp_c16(temp_c16) {
        temp_c16
    } else {
        TEMP_C16_INVALID
    }
}

#[derive(Debug, Clone, Default)]
pub struct SupplyMonitor {
    last_cv: Option<u16>,
}

impl SupplyMonitor {
    pub fn record(&mut self, centivolts: u16) {
        if centivolts != 0 {
            self.last_cv = Some(centivolts);
        }
    }

    pub fn centivolts(&self) -> Option<u16> {
        self.last_cv
    }

    pub fn is_battery_low(&self) -> bool {
        self.last_cv.is_some_and(|cv| cv <= BATTERY_LOW_CV)
    }

    pub fn conserve_battery(&self) -> bool {
        self.last_cv.is_some_and(|cv| cv < BATTERY_CONSERVE_CV)
    }
}

pub const TEMP_POT_FROST_END: u8 = 16;
pub const TEMP_POT_BAKE_END: u8 = 240;
const TEMP_POT_NOISE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PotEvent {
    pub moved: bool,
    pub mode: Option<ValveMode>,
}

#[derive(Debug, Clone, Default)]
pub struct TempPotTracker {
    last_raw: Option<u8>,
}

impl TempPotTracker {
    pub fn update(&mut self, raw: u8) -> PotEvent {
        let Some(prev) = self.last_raw else {
            self.last_raw = Some(raw);
            return PotEvent::default();
        };
        if raw.abs_diff(prev) < TEMP_POT_NOISE {
            return PotEvent::default();
        }
        self.last_raw = Some(raw);

        let zone = |v: u8| {
            if v <= TEMP_POT_FROST_END {
                ValveMode::Frost
            } else if v >= TEMP_POT_BAKE_END {
                ValveMode::Bake
            } else {
                ValveMode::Warm
            }
        };
        let (before, after) = (zone(prev), zone(raw));
        PotEvent {
            moved: true,
            mode: (before != after).then_some(after),
        }
    }

    pub fn raw(&self) -> Option<u8> {
        self.last_raw
    }

    pub fn warm_target_c(&self) -> Option<u8> {
        self.last_raw.map(pot_to_warm_target_c)
    }
}

pub fn pot_to_warm_target_c(raw: u8) -> u8 {
    if raw <= TEMP_POT_FROST_END {
        return TEMP_SCALE_MIN;
    }
    if raw >= TEMP_POT_BAKE_END {
        return TEMP_SCALE_MAX;
    }
    let span = u16::from(TEMP_POT_BAKE_END - TEMP_POT_FROST_END);
    let steps = u16::from(TEMP_SCALE_MAX - TEMP_SCALE_MIN) + 1;
    let offset = u16::from(raw - TEMP_POT_FROST_END) * steps / span;
    (TEMP_SCALE_MIN + offset as u8).min(TEMP_SCALE_MAX)
}
