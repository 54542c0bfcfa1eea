use log::info;

use crate::nvstore::{layout, NvStore, ERASED_BYTE};

pub const SCHEDULE_GRANULARITY_M: u16 = 6;
pub const MINUTES_PER_DAY: u16 = 24 * 60;
pub const SCHEDULE_SLOTS: u8 = layout::SCHEDULE_SLOTS as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEdge {
    On,
    Off,
}

#[derive(Debug, Clone, Copy)]
pub struct SimpleValveSchedule {
    duration_m: u16,
}

impl SimpleValveSchedule {
    pub fn new(duration_m: u16) -> Self {
        Self {
            duration_m: duration_m.clamp(SCHEDULE_GRANULARITY_M, MINUTES_PER_DAY - SCHEDULE_GRANULARITY_M),
        }
    }

    pub fn duration_m(&self) -> u16 {
        self.duration_m
    }

    fn addr(slot: u8) -> Option<usize> {
        (slot < SCHEDULE_SLOTS).then(|| layout::SCHEDULE + usize::from(slot) * 2)
    }

    fn decode(raw: u8) -> Option<u16> {
        let minutes = u16::from(raw) * SCHEDULE_GRANULARITY_M;
        (raw != ERASED_BYTE && minutes < MINUTES_PER_DAY).then_some(minutes)
    }

    pub fn set(&self, nv: &mut impl NvStore, slot: u8, start_m: u16) -> bool {
        let Some(addr) = Self::addr(slot) else {
            return false;
        };
        if start_m >= MINUTES_PER_DAY {
            return false;
        }
        let on = start_m / SCHEDULE_GRANULARITY_M;
        let off = ((start_m + self.duration_m) % MINUTES_PER_DAY) / SCHEDULE_GRANULARITY_M;
        nv.write_if_changed(addr, on as u8);
        nv.write_if_changed(addr + 1, off as u8);
        info!("schedule slot {slot} on at {start_m}m for {}m", self.duration_m);
        true
    }

    pub fn clear(&self, nv: &mut impl NvStore, slot: u8) -> bool {
        let Some(addr) = Self::addr(slot) else {
            return false;
        };
        nv.erase_byte(addr);
        nv.erase_byte(addr + 1);
        true
    }

    pub fn slot(&self, nv: &impl NvStore, slot: u8) -> Option<(u16, u16)> {
        let addr = Self::addr(slot)?;
        let on = Self::decode(nv.read_byte(addr))?;
        let off = Self::decode(nv.read_byte(addr + 1))?;
        Some((on, off))
    }

    fn slots<'a>(&'a self, nv: &'a impl NvStore) -> impl Iterator<Item = (u16, u16)> + 'a {
        (0..SCHEDULE_SLOTS).filter_map(move |slot| self.slot(nv, slot))
    }

    pub fn any_programmed(&self, nv: &impl NvStore) -> bool {
        self.slots(nv).next().is_some()
    }

    pub fn is_on_now(&self, nv: &impl NvStore, now_m: u16) -> bool {
        self.slots(nv).any(|(on, off)| within(now_m, on, off))
    }

    /// True during the pre-warm window leading up to any WARM period.
    pub fn is_on_soon(&self, nv: &impl NvStore, now_m: u16, prewarm_m: u16) -> bool {
        self.slots(nv).any(|(on, _)| {
            let window_start = (on + MINUTES_PER_DAY - prewarm_m.min(MINUTES_PER_DAY - 1)) % MINUTES_PER_DAY;
            within(now_m, window_start, on)
        })
    }

    pub fn edge_at(&self, nv: &impl NvStore, now_m: u16) -> Option<ScheduleEdge> {
        let mut edge = None;
        for (on, off) in self.slots(nv) {
            if now_m == on {
                return Some(ScheduleEdge::On);
            }
            if now_m == off {
                edge = Some(ScheduleEdge::Off);
            }
        }
        edge
    }
}

fn within(now_m: u16, start_m: u16, end_m: u16) -> bool {
    if start_m <= end_m {
        (start_m..end_m).contains(&now_m)
    } else {
        now_m >= start_m || now_m < end_m
    }
}
