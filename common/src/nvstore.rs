use log::warn;
use sha2::{Digest, Sha256};

use crate::{
    config::{
        DEFAULT_FROST_C, DEFAULT_MIN_BOILER_ON_MINS, DEFAULT_WARM_C, MAX_TARGET_C, MIN_TARGET_C,
    },
    types::StatsTxLevel,
};

pub const ERASED_BYTE: u8 = 0xff;

pub mod layout {
    pub const DEVICE_ID: usize = 0;
    pub const DEVICE_ID_LEN: usize = 8;
    pub const RESET_COUNT: usize = 8;
    pub const OVERRUN_COUNT: usize = 9;
    pub const FROST_C: usize = 12;
    pub const WARM_C: usize = 13;
    pub const MIN_BOILER_ON_M: usize = 14;
    pub const MIN_VALVE_PC_OPEN: usize = 15;
    pub const FHT8V_HC1: usize = 16;
    pub const FHT8V_HC2: usize = 17;
    pub const STATS_TX_LEVEL: usize = 18;
    pub const SCHEDULE: usize = 20;
    pub const SCHEDULE_SLOTS: usize = 2;
    pub const STATS: usize = 32;
    pub const STATS_SET_LEN: usize = 24;
    pub const STATS_SETS: usize = 8;
    pub const SECRET_KEY: usize = STATS + STATS_SETS * STATS_SET_LEN;
    pub const SECRET_KEY_LEN: usize = 16;
    pub const SIZE: usize = 256;

    const _: () = assert!(SCHEDULE + SCHEDULE_SLOTS * 2 <= STATS);
    const _: () = assert!(SECRET_KEY + SECRET_KEY_LEN <= SIZE);
}

pub trait NvStore {
    fn len(&self) -> usize;

    fn read_byte(&self, addr: usize) -> u8;

    /// Writes `value` only if it differs from what is stored.
    /// Returns true if a physical write happened.
    fn write_if_changed(&mut self, addr: usize, value: u8) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn erase_byte(&mut self, addr: usize) -> bool {
        self.write_if_changed(addr, ERASED_BYTE)
    }

    fn read_u16(&self, addr: usize) -> u16 {
        u16::from_le_bytes([self.read_byte(addr), self.read_byte(addr + 1)])
    }

    fn write_u16_if_changed(&mut self, addr: usize, value: u16) -> bool {
        let [lo, hi] = value.to_le_bytes();
        let wrote_lo = self.write_if_changed(addr, lo);
        let wrote_hi = self.write_if_changed(addr + 1, hi);
        wrote_lo || wrote_hi
    }
}

#[derive(Debug, Clone)]
pub struct MemNvStore {
    bytes: Vec<u8>,
    physical_writes: usize,
}

impl MemNvStore {
    pub fn new() -> Self {
        Self::from_bytes(vec![ERASED_BYTE; layout::SIZE])
    }

    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        bytes.resize(layout::SIZE, ERASED_BYTE);
        Self {
            bytes,
            physical_writes: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn physical_writes(&self) -> usize {
        self.physical_writes
    }
}

impl Default for MemNvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NvStore for MemNvStore {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read_byte(&self, addr: usize) -> u8 {
        self.bytes.get(addr).copied().unwrap_or(ERASED_BYTE)
    }

    fn write_if_changed(&mut self, addr: usize, value: u8) -> bool {
        let Some(slot) = self.bytes.get_mut(addr) else {
            warn!("nv write out of range at {addr}");
            return false;
        };
        if *slot == value {
            return false;
        }
        *slot = value;
        self.physical_writes += 1;
        true
    }
}

/// Typed access to the persisted settings, with defaults for erased values.
pub trait SettingsStore: NvStore {
    fn frost_target_c(&self) -> u8 {
        match self.read_byte(layout::FROST_C) {
            ERASED_BYTE => DEFAULT_FROST_C,
            raw => raw.clamp(MIN_TARGET_C, MAX_TARGET_C),
        }
    }

    fn warm_target_c(&self) -> u8 {
        let warm = match self.read_byte(layout::WARM_C) {
            ERASED_BYTE => DEFAULT_WARM_C,
            raw => raw.clamp(MIN_TARGET_C, MAX_TARGET_C),
        };
        warm.max(self.frost_target_c())
    }

    fn set_frost_target_c(&mut self, temp_c: u8) -> bool {
        if temp_c < MIN_TARGET_C || temp_c > self.warm_target_c() {
            return false;
        }
        self.write_if_changed(layout::FROST_C, temp_c);
        true
    }

    fn set_warm_target_c(&mut self, temp_c: u8) -> bool {
        if temp_c > MAX_TARGET_C || temp_c < self.frost_target_c() || temp_c < MIN_TARGET_C {
            return false;
        }
        self.write_if_changed(layout::WARM_C, temp_c);
        true
    }

    fn min_boiler_on_minutes(&self) -> u8 {
        match self.read_byte(layout::MIN_BOILER_ON_M) {
            ERASED_BYTE => DEFAULT_MIN_BOILER_ON_MINS,
            raw => raw,
        }
    }

    fn set_min_boiler_on_minutes(&mut self, minutes: u8) -> bool {
        if minutes == ERASED_BYTE {
            return false;
        }
        self.write_if_changed(layout::MIN_BOILER_ON_M, minutes);
        true
    }

    fn min_valve_pc_open_override(&self) -> Option<u8> {
        match self.read_byte(layout::MIN_VALVE_PC_OPEN) {
            0 | ERASED_BYTE => None,
            pc => Some(pc.min(100)),
        }
    }

    fn set_min_valve_pc_open_override(&mut self, pc: Option<u8>) -> bool {
        match pc {
            Some(pc) if (1..=100).contains(&pc) => {
                self.write_if_changed(layout::MIN_VALVE_PC_OPEN, pc);
                true
            }
            Some(_) => false,
            None => {
                self.erase_byte(layout::MIN_VALVE_PC_OPEN);
                true
            }
        }
    }

    fn fht8v_house_codes(&self) -> Option<(u8, u8)> {
        let hc1 = self.read_byte(layout::FHT8V_HC1);
        let hc2 = self.read_byte(layout::FHT8V_HC2);
        (hc1 <= 99 && hc2 <= 99).then_some((hc1, hc2))
    }

    fn set_fht8v_house_codes(&mut self, codes: Option<(u8, u8)>) -> bool {
        match codes {
            Some((hc1, hc2)) if hc1 <= 99 && hc2 <= 99 => {
                self.write_if_changed(layout::FHT8V_HC1, hc1);
                self.write_if_changed(layout::FHT8V_HC2, hc2);
                true
            }
            Some(_) => false,
            None => {
                self.erase_byte(layout::FHT8V_HC1);
                self.erase_byte(layout::FHT8V_HC2);
                true
            }
        }
    }

    fn stats_tx_level(&self) -> StatsTxLevel {
        StatsTxLevel(self.read_byte(layout::STATS_TX_LEVEL))
    }

    fn set_stats_tx_level(&mut self, level: StatsTxLevel) {
        self.write_if_changed(layout::STATS_TX_LEVEL, level.0);
    }

    fn device_id(&self) -> [u8; layout::DEVICE_ID_LEN] {
        let mut id = [0u8; layout::DEVICE_ID_LEN];
        for (offset, byte) in id.iter_mut().enumerate() {
            *byte = self.read_byte(layout::DEVICE_ID + offset);
        }
        id
    }

    fn has_valid_device_id(&self) -> bool {
        let id = self.device_id();
        id.iter().all(|b| b & 0x80 != 0) && id.iter().any(|b| *b != ERASED_BYTE)
    }

    fn regenerate_device_id(&mut self, entropy: &[u8]) -> [u8; layout::DEVICE_ID_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(entropy);
        hasher.update(self.device_id());
        hasher.update([self.read_byte(layout::RESET_COUNT)]);
        let digest = hasher.finalize();

        let mut id = [0u8; layout::DEVICE_ID_LEN];
        for (offset, byte) in id.iter_mut().enumerate() {
            *byte = digest[offset] | 0x80;
            if *byte == ERASED_BYTE {
                *byte = 0xfe;
            }
            self.write_if_changed(layout::DEVICE_ID + offset, *byte);
        }
        id
    }

    fn ensure_device_id(&mut self, entropy: &[u8]) -> [u8; layout::DEVICE_ID_LEN] {
        if self.has_valid_device_id() {
            self.device_id()
        } else {
            self.regenerate_device_id(entropy)
        }
    }

    fn short_id(&self) -> u16 {
        let id = self.device_id();
        u16::from_be_bytes([id[0], id[1]])
    }

    fn bump_reset_count(&mut self) -> u8 {
        let count = self.read_byte(layout::RESET_COUNT).wrapping_add(1);
        self.write_if_changed(layout::RESET_COUNT, count);
        count
    }

    fn overrun_count(&self) -> u16 {
        match self.read_u16(layout::OVERRUN_COUNT) {
            0xffff => 0,
            count => count,
        }
    }

    fn bump_overrun_count(&mut self) -> u16 {
        let count = self.overrun_count().saturating_add(1).min(0xfffe);
        self.write_u16_if_changed(layout::OVERRUN_COUNT, count);
        count
    }

    fn secret_key(&self) -> Option<[u8; layout::SECRET_KEY_LEN]> {
        let mut key = [0u8; layout::SECRET_KEY_LEN];
        for (offset, byte) in key.iter_mut().enumerate() {
            *byte = self.read_byte(layout::SECRET_KEY + offset);
        }
        key.iter().any(|b| *b != ERASED_BYTE).then_some(key)
    }

    fn set_secret_key(&mut self, key: Option<&[u8; layout::SECRET_KEY_LEN]>) {
        for offset in 0..layout::SECRET_KEY_LEN {
            let value = key.map(|k| k[offset]).unwrap_or(ERASED_BYTE);
            self.write_if_changed(layout::SECRET_KEY + offset, value);
        }
    }
}

impl<T: NvStore + ?Sized> SettingsStore for T {}
