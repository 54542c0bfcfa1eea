use serde::{Deserialize, Serialize};

pub const BAKE_MAX_M: u8 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValveMode {
    #[default]
    Frost,
    Warm,
    Bake,
}

impl ValveMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Frost => "FROST",
            Self::Warm => "WARM",
            Self::Bake => "BAKE",
        }
    }

    pub fn status_char(self) -> char {
        match self {
            Self::Frost => 'F',
            Self::Warm => 'W',
            Self::Bake => 'B',
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeState {
    warm: bool,
    bake_countdown_m: u8,
}

impl ModeState {
    pub fn mode(&self) -> ValveMode {
        if self.in_bake_mode() {
            ValveMode::Bake
        } else if self.warm {
            ValveMode::Warm
        } else {
            ValveMode::Frost
        }
    }

    pub fn in_warm_mode(&self) -> bool {
        self.warm
    }

    pub fn in_bake_mode(&self) -> bool {
        self.warm && self.bake_countdown_m > 0
    }

    pub fn bake_remaining_m(&self) -> u8 {
        self.bake_countdown_m
    }

    /// Switches between WARM and FROST; leaving WARM always cancels BAKE.
    /// Returns true if anything changed.
    pub fn set_warm_mode(&mut self, warm: bool) -> bool {
        let before = *self;
        self.warm = warm;
        if !warm {
            self.bake_countdown_m = 0;
        }
        before != *self
    }

    pub fn start_bake(&mut self) {
        self.warm = true;
        self.bake_countdown_m = BAKE_MAX_M;
    }

    pub fn cancel_bake(&mut self) {
        self.bake_countdown_m = 0;
    }

    pub fn tick_minute(&mut self) {
        self.bake_countdown_m = self.bake_countdown_m.saturating_sub(1);
    }

    pub fn cycle_from_button(&mut self) {
        match self.mode() {
            ValveMode::Frost => {
                self.set_warm_mode(true);
            }
            ValveMode::Warm => self.start_bake(),
            ValveMode::Bake => {
                self.set_warm_mode(false);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatsTxLevel(pub u8);

impl StatsTxLevel {
    pub const ALWAYS_ALL: Self = Self(0);
    pub const MOST_UNSECURED: Self = Self(0x80);
    pub const SECURE_ONLY: Self = Self(0xfe);
    pub const NEVER: Self = Self(0xff);

    pub fn allows_insecure(self) -> bool {
        self <= Self::MOST_UNSECURED
    }

    pub fn allows_sensitive_insecure(self) -> bool {
        self < Self::MOST_UNSECURED
    }

    pub fn allows_any_tx(self) -> bool {
        self != Self::NEVER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bake_always_implies_warm() {
        let mut mode = ModeState::default();
        assert_eq!(mode.mode(), ValveMode::Frost);

        mode.start_bake();
        assert!(mode.in_warm_mode());
        assert!(mode.in_bake_mode());

        mode.set_warm_mode(false);
        assert!(!mode.in_bake_mode());
        assert_eq!(mode.bake_remaining_m(), 0);
    }

    #[test]
    fn cancel_bake_is_idempotent() {
        let mut once = ModeState::default();
        once.start_bake();
        once.cancel_bake();

        let mut twice = ModeState::default();
        twice.start_bake();
        twice.cancel_bake();
        twice.cancel_bake();

        assert_eq!(once, twice);
        assert_eq!(twice.mode(), ValveMode::Warm);
    }

    #[test]
    fn bake_runs_down_to_warm() {
        let mut mode = ModeState::default();
        mode.start_bake();
        for _ in 0..BAKE_MAX_M {
            assert!(mode.in_bake_mode());
            mode.tick_minute();
        }
        assert_eq!(mode.mode(), ValveMode::Warm);
    }

    #[test]
    fn button_cycles_modes() {
        let mut mode = ModeState::default();
        mode.cycle_from_button();
        assert_eq!(mode.mode(), ValveMode::Warm);
        mode.cycle_from_button();
        assert_eq!(mode.mode(), ValveMode::Bake);
        mode.cycle_from_button();
        assert_eq!(mode.mode(), ValveMode::Frost);
    }

    #[test]
    fn stats_tx_levels() {
        assert!(StatsTxLevel::ALWAYS_ALL.allows_sensitive_insecure());
        assert!(StatsTxLevel::MOST_UNSECURED.allows_insecure());
        assert!(!StatsTxLevel::MOST_UNSECURED.allows_sensitive_insecure());
        assert!(!StatsTxLevel::SECURE_ONLY.allows_insecure());
        assert!(StatsTxLevel::SECURE_ONLY.allows_any_tx());
        assert!(!StatsTxLevel::NEVER.allows_any_tx());
    }
}
