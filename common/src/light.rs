use log::debug;

use crate::sensors::BYTE_SENSOR_INVALID;

pub const DEFAULT_DARK_THRESHOLD: u8 = 16;
const LIGHT_HYSTERESIS: u8 = 8;
pub const RECENTLY_LIT_M: u8 = 60;
const MIN_AUTO_RANGE_SPAN: u8 = 16;

#[derive(Debug, Clone)]
pub struct AmbientLight {
    dark_threshold: u8,
    raw: Option<u8>,
    lit: Option<bool>,
    dark_minutes: u16,
    recently_lit_countdown_m: u8,
}

impl Default for AmbientLight {
    fn default() -> Self {
        Self::new()
    }
}

impl AmbientLight {
    pub fn new() -> Self {
        Self {
            dark_threshold: DEFAULT_DARK_THRESHOLD,
            raw: None,
            lit: None,
            dark_minutes: 0,
            recently_lit_countdown_m: 0,
        }
    }

    pub fn update(&mut self, raw: u8) -> bool {
        if raw == BYTE_SENSOR_INVALID {
            return false;
        }
        self.raw = Some(raw);
        let lit_threshold = self.dark_threshold.saturating_add(LIGHT_HYSTERESIS);
        let now_lit = match self.lit {
            Some(true) => raw > self.dark_threshold,
            _ => raw > lit_threshold,
        };
        let was_dark = self.lit == Some(false);
        self.lit = Some(now_lit);
        if now_lit {
            self.recently_lit_countdown_m = RECENTLY_LIT_M;
            self.dark_minutes = 0;
        }
        was_dark && now_lit
    }

    pub fn tick_minute(&mut self) {
        match self.lit {
            Some(false) => self.dark_minutes = self.dark_minutes.saturating_add(1),
            Some(true) => self.recently_lit_countdown_m = RECENTLY_LIT_M,
            None => {}
        }
        if self.lit != Some(true) {
            self.recently_lit_countdown_m = self.recently_lit_countdown_m.saturating_sub(1);
        }
    }

    pub fn raw(&self) -> Option<u8> {
        self.raw
    }

    pub fn is_room_lit(&self) -> bool {
        self.lit == Some(true)
    }

    pub fn is_room_dark(&self) -> bool {
        self.lit == Some(false)
    }

    pub fn is_known(&self) -> bool {
        self.lit.is_some()
    }

    pub fn recently_lit(&self) -> bool {
        self.is_room_lit() || self.recently_lit_countdown_m > 0
    }

    pub fn dark_minutes(&self) -> u16 {
        self.dark_minutes
    }

    pub fn dark_threshold(&self) -> u8 {
        self.dark_threshold
    }

    pub fn set_min_max(&mut self, min: Option<u8>, max: Option<u8>) {
        let (Some(min), Some(max)) = (min, max) else {
            return;
        };
        if max <= min || max - min < MIN_AUTO_RANGE_SPAN {
            return;
        }
        let threshold = min + (max - min) / 4;
        if threshold != self.dark_threshold {
            debug!("ambient light dark threshold {} -> {threshold}", self.dark_threshold);
            self.dark_threshold = threshold;
        }
    }
}
