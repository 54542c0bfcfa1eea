pub const OCCUPATION_TIMEOUT_M: u8 = 50;
pub const OCCUPATION_TIMEOUT_MAYBE_M: u8 = 10;
pub const LONG_VACANT_H: u16 = 12;
pub const LONG_LONG_VACANT_H: u16 = 72;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccupancyTracker {
    countdown_m: u8,
    vacancy_m: u8,
    vacancy_h: u16,
}

impl OccupancyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_as_occupied(&mut self) {
        self.countdown_m = OCCUPATION_TIMEOUT_M;
        self.clear_vacancy();
    }

    pub fn mark_as_possibly_occupied(&mut self) {
        self.countdown_m = self.countdown_m.max(OCCUPATION_TIMEOUT_MAYBE_M);
        self.clear_vacancy();
    }

    pub fn tick_minute(&mut self) {
        if self.countdown_m > 0 {
            self.countdown_m -= 1;
            return;
        }
        self.vacancy_m += 1;
        if self.vacancy_m >= 60 {
            self.vacancy_m = 0;
            self.vacancy_h = self.vacancy_h.saturating_add(1);
        }
    }

    pub fn is_likely_occupied(&self) -> bool {
        self.countdown_m > 0
    }

    pub fn is_likely_unoccupied(&self) -> bool {
        !self.is_likely_occupied()
    }

    pub fn occupancy_pc(&self) -> u8 {
        ((u16::from(self.countdown_m) * 100) / u16::from(OCCUPATION_TIMEOUT_M)) as u8
    }

    pub fn vacancy_h(&self) -> u16 {
        self.vacancy_h
    }

    pub fn is_long_vacant(&self) -> bool {
        self.vacancy_h >= LONG_VACANT_H
    }

    pub fn is_long_long_vacant(&self) -> bool {
        self.vacancy_h >= LONG_LONG_VACANT_H
    }

    pub fn two_bit_level(&self) -> u8 {
        match self.countdown_m {
            0 if self.vacancy_h > 0 => 1,
            0 => 0,
            m if m > OCCUPATION_TIMEOUT_MAYBE_M => 3,
            _ => 2,
        }
    }

    fn clear_vacancy(&mut self) {
        self.vacancy_m = 0;
        self.vacancy_h = 0;
    }
}
