use log::debug;

use crate::{config::ValveTuning, sensors::TEMP_C16_INVALID};

pub const FILTER_LENGTH: usize = 16;
pub const MAX_TEMP_JUMP_C16: i16 = 3;
pub const ANTISEEK_VALVE_RECLOSE_DELAY_M: u8 = 5;
pub const ANTISEEK_VALVE_REOPEN_DELAY_M: u8 = 10;
pub const CUMULATIVE_MOVEMENT_MASK: u16 = 0x1fff;

const HALF_DEADBAND_C16: i16 = 2;
const HALF_DEADBAND_WIDE_C16: i16 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValveInputs {
    pub target_c: u8,
    pub min_pc_open: u8,
    pub max_pc_open: u8,
    pub slew_pc: u8,
    pub slew_pc_fast: u8,
    pub glacial: bool,
    pub in_bake_mode: bool,
    pub has_eco_bias: bool,
    pub fast_response: bool,
    pub widen_deadband: bool,
    pub ref_temp_c16: i16,
}

impl ValveInputs {
    pub fn new(tuning: &ValveTuning, target_c: u8, ref_temp_c16: i16) -> Self {
        Self {
            target_c,
            min_pc_open: tuning.min_really_open_pc,
            max_pc_open: tuning.max_pc_open.max(tuning.min_really_open_pc),
            slew_pc: tuning.slew_pc_per_min,
            slew_pc_fast: tuning.slew_pc_per_min_fast.max(tuning.slew_pc_per_min),
            glacial: tuning.glacial,
            in_bake_mode: false,
            has_eco_bias: false,
            fast_response: false,
            widen_deadband: false,
            ref_temp_c16,
        }
    }

    fn normalise(&self, pc: u8) -> u8 {
        if pc == 0 {
            0
        } else {
            pc.clamp(self.min_pc_open, self.max_pc_open)
        }
    }

    fn close_to(&self, pc: u8) -> u8 {
        if pc < self.min_pc_open {
            0
        } else {
            pc.min(self.max_pc_open)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelledRadValveState {
    initialised: bool,
    prev_raw_temp_c16: [i16; FILTER_LENGTH],
    is_filtering: bool,
    valve_moved: bool,
    cumulative_movement_pc: u16,
    valve_turndown_countdown_m: u8,
    valve_turnup_countdown_m: u8,
}

impl Default for ModelledRadValveState {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelledRadValveState {
    pub fn new() -> Self {
        Self {
            initialised: false,
            prev_raw_temp_c16: [0; FILTER_LENGTH],
            is_filtering: false,
            valve_moved: false,
            cumulative_movement_pc: 0,
            valve_turndown_countdown_m: 0,
            valve_turnup_countdown_m: 0,
        }
    }

    pub fn is_filtering(&self) -> bool {
        self.is_filtering
    }

    pub fn valve_moved(&self) -> bool {
        self.valve_moved
    }

    pub fn cumulative_movement_pc(&self) -> u16 {
        self.cumulative_movement_pc
    }

    pub fn dont_turn_up(&self) -> bool {
        self.valve_turnup_countdown_m > 0
    }

    pub fn dont_turn_down(&self) -> bool {
        self.valve_turndown_countdown_m > 0
    }

    pub fn smoothed_temp_c16(&self) -> i16 {
        let sum: i32 = self.prev_raw_temp_c16.iter().map(|t| i32::from(*t)).sum();
        let n = FILTER_LENGTH as i32;
        (sum + n / 2).div_euclid(n) as i16
    }

    pub fn tick(&mut self, value_pc: &mut u8, inputs: &ValveInputs) {
        let raw = inputs.ref_temp_c16;
        if self.initialised {
            self.prev_raw_temp_c16.copy_within(0..FILTER_LENGTH - 1, 1);
            self.prev_raw_temp_c16[0] = raw;
        } else {
            self.prev_raw_temp_c16 = [raw; FILTER_LENGTH];
            self.initialised = true;
        }

        self.valve_turndown_countdown_m = self.valve_turndown_countdown_m.saturating_sub(1);
        self.valve_turnup_countdown_m = self.valve_turnup_countdown_m.saturating_sub(1);

        self.update_filtering();

        let old = *value_pc;
        let new = self.compute_required_pc_open(old, inputs);
        self.valve_moved = new != old;
        if self.valve_moved {
            if new > old {
                self.valve_turndown_countdown_m = ANTISEEK_VALVE_RECLOSE_DELAY_M;
            } else {
                self.valve_turnup_countdown_m = ANTISEEK_VALVE_REOPEN_DELAY_M;
            }
            let moved = u16::from(old.abs_diff(new));
            self.cumulative_movement_pc =
                (self.cumulative_movement_pc + moved) & CUMULATIVE_MOVEMENT_MASK;
            *value_pc = new;
        }
    }

    fn update_filtering(&mut self) {
        let history = &self.prev_raw_temp_c16;
        if !self.is_filtering {
            if (history[0] - history[1]).abs() > MAX_TEMP_JUMP_C16 {
                debug!("valve temperature filtering on");
                self.is_filtering = true;
            }
        } else {
            let settled = (self.smoothed_temp_c16() - history[0]).abs() <= 1
                && (history[0] - history[FILTER_LENGTH - 1]).abs() <= MAX_TEMP_JUMP_C16;
            if settled {
                debug!("valve temperature filtering off");
                self.is_filtering = false;
            }
        }
    }

    /// Proportional controller with hysteresis. Quick to close, slow to open.
    ///
    /// The result is always 0 or within `[min_pc_open, max_pc_open]`.
    pub fn compute_required_pc_open(&self, prior_pc: u8, inputs: &ValveInputs) -> u8 {
        let p = prior_pc.min(100);
        let (min, max) = (inputs.min_pc_open, inputs.max_pc_open);

        let adjusted_c16 = if self.is_filtering {
            self.smoothed_temp_c16()
        } else {
            inputs.ref_temp_c16
        };
        let adjusted_c = adjusted_c16 >> 4;
        let t = i16::from(inputs.target_c);
        let wide = i16::from(inputs.widen_deadband);

        if adjusted_c < t {
            if self.dont_turn_up() && !inputs.in_bake_mode {
                return inputs.normalise(p);
            }
            if inputs.glacial {
                return if p < min { min } else { p.saturating_add(1).min(max) };
            }
            if inputs.fast_response || inputs.in_bake_mode {
                return max;
            }
            if p < min {
                return min;
            }
            let base = if inputs.has_eco_bias {
                inputs.slew_pc
            } else {
                inputs.slew_pc_fast
            };
            let step = if adjusted_c < t - 1 { base.max(p / 2) } else { base };
            return p.saturating_add(step).min(max);
        }

        if adjusted_c > t + wide {
            if p == 0 {
                return 0;
            }
            if self.dont_turn_down() {
                return inputs.close_to(p);
            }
            if inputs.glacial {
                return inputs.close_to(p - 1);
            }
            if adjusted_c > t + wide + 1 {
                return 0;
            }
            let step = inputs.slew_pc_fast.max(p / 2);
            return inputs.close_to(p.saturating_sub(step));
        }

        let band_c16 = 16 * (1 + wide);
        let error = (adjusted_c16 - (t << 4)) - band_c16 / 2;
        let half_deadband = if inputs.widen_deadband {
            HALF_DEADBAND_WIDE_C16
        } else {
            HALF_DEADBAND_C16
        };
        if error.abs() <= half_deadband {
            return inputs.normalise(p);
        }
        if error < 0 {
            if p == 0 {
                return 0;
            }
            let step = if inputs.glacial { 1 } else { inputs.slew_pc };
            return p.saturating_add(step).clamp(min, max);
        }
        let step = if inputs.glacial { 1 } else { inputs.slew_pc_fast };
        inputs.close_to(p.saturating_sub(step))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelledRadValve {
    state: ModelledRadValveState,
    value_pc: u8,
    target_c: u8,
    ref_temp_c16: i16,
    safer_open_pc: u8,
}

impl ModelledRadValve {
    pub fn new(tuning: &ValveTuning) -> Self {
        Self {
            state: ModelledRadValveState::new(),
            value_pc: 0,
            target_c: 0,
            ref_temp_c16: TEMP_C16_INVALID,
            safer_open_pc: tuning.safer_open_pc,
        }
    }

    pub fn read(&mut self, inputs: &ValveInputs) -> u8 {
        self.target_c = inputs.target_c;
        self.ref_temp_c16 = inputs.ref_temp_c16;
        if inputs.ref_temp_c16 == TEMP_C16_INVALID {
            return self.value_pc;
        }
        self.state.tick(&mut self.value_pc, inputs);
        self.value_pc
    }

    pub fn value_pc(&self) -> u8 {
        self.value_pc
    }

    pub fn target_c(&self) -> u8 {
        self.target_c
    }

    pub fn state(&self) -> &ModelledRadValveState {
        &self.state
    }

    pub fn is_calling_for_heat(&self, actuator_really_open: bool) -> bool {
        self.ref_temp_c16 != TEMP_C16_INVALID
            && self.ref_temp_c16 < i16::from(self.target_c) << 4
            && self.value_pc >= self.safer_open_pc
            && actuator_really_open
    }
}
