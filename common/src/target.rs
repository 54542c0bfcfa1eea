use crate::{
    config::{TargetTuning, BIASCOM_WARM, BIASECO_WARM, MAX_TARGET_C, TEMP_SCALE_MID},
    types::ValveMode,
};

pub fn has_eco_bias(warm_c: u8, battery_low: bool) -> bool {
    warm_c < TEMP_SCALE_MID || battery_low
}

pub fn is_eco_temperature(temp_c: u8) -> bool {
    temp_c <= BIASECO_WARM
}

pub fn is_comfort_temperature(temp_c: u8) -> bool {
    temp_c >= BIASCOM_WARM
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInputs {
    pub mode: ValveMode,
    pub frost_c: u8,
    pub warm_c: u8,
    pub battery_low: bool,
    pub likely_occupied: bool,
    pub long_vacant: bool,
    pub long_long_vacant: bool,
    pub vacancy_h: u16,
    pub room_dark: bool,
    pub recently_lit: bool,
    pub dark_minutes: u16,
    pub occ_pc_this_hour: Option<u8>,
    pub occ_pc_next_hour: Option<u8>,
    pub schedule_on_now: bool,
    pub schedule_on_soon: bool,
    pub recent_ui_use: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SetbackTier {
    None,
    Default,
    Eco,
    Full,
}

impl SetbackTier {
    pub fn degrees(self, tuning: &TargetTuning) -> u8 {
        match self {
            Self::None => 0,
            Self::Default => tuning.setback_default_c,
            Self::Eco => tuning.setback_eco_c,
            Self::Full => tuning.setback_full_c,
        }
    }
}

impl TargetInputs {
    fn eco_bias(&self) -> bool {
        has_eco_bias(self.warm_c, self.battery_low)
    }

    fn nlo_threshold(&self, tuning: &TargetTuning) -> u8 {
        if self.eco_bias() {
            tuning.this_hour_nlo_threshold_eco
        } else {
            tuning.this_hour_nlo_threshold_comfort
        }
    }

    fn not_likely_occupied_soon(&self, tuning: &TargetTuning) -> bool {
        if self.long_long_vacant {
            return true;
        }
        let threshold = self.nlo_threshold(tuning);
        match (self.occ_pc_this_hour, self.occ_pc_next_hour) {
            (Some(this), Some(next)) => {
                !self.likely_occupied && this < threshold && next < threshold
            }
            _ => false,
        }
    }

    fn moderate_occupancy_history(&self, tuning: &TargetTuning) -> bool {
        self.occ_pc_this_hour
            .is_some_and(|pc| pc >= self.nlo_threshold(tuning))
    }

    fn long_dark_and_vacant(&self, tuning: &TargetTuning) -> bool {
        let hours = tuning.min_vacancy_and_dark_for_full_setback_h;
        self.dark_minutes > 60 * u16::from(hours) && self.vacancy_h > u16::from(hours)
    }
}

/// Picks the WARM-mode setback tier. Rules are tried in order; the first
/// that matches wins.
pub fn warm_setback_tier(inputs: &TargetInputs, tuning: &TargetTuning) -> SetbackTier {
    let setback_allowed = !inputs.likely_occupied
        && (inputs.room_dark || inputs.long_vacant)
        && !inputs.schedule_on_now
        && !inputs.recent_ui_use;
    if !setback_allowed {
        return SetbackTier::None;
    }

    let rules: [(fn(&TargetInputs, &TargetTuning) -> bool, SetbackTier); 5] = [
        (|i, _| is_comfort_temperature(i.warm_c), SetbackTier::Default),
        (|i, _| i.likely_occupied, SetbackTier::Default),
        (
            |i, t| !i.long_vacant && i.recently_lit && i.moderate_occupancy_history(t),
            SetbackTier::Default,
        ),
        (|i, _| i.schedule_on_soon, SetbackTier::Default),
        (
            |i, t| {
                i.eco_bias()
                    && (i.long_long_vacant
                        || (i.not_likely_occupied_soon(t)
                            && (is_eco_temperature(i.warm_c) || i.long_dark_and_vacant(t))))
            },
            SetbackTier::Full,
        ),
    ];
    rules
        .iter()
        .find(|(matches, _)| matches(inputs, tuning))
        .map_or(SetbackTier::Eco, |(_, tier)| *tier)
}

/// Target temperature in whole degrees C.
///
/// Never below the FROST target and never above [`MAX_TARGET_C`].
pub fn compute_target_temp(inputs: &TargetInputs, tuning: &TargetTuning) -> u8 {
    let frost = inputs.frost_c.min(MAX_TARGET_C);
    let wt = inputs.warm_c.max(frost);

    let target = match inputs.mode {
        ValveMode::Frost => {
            if !inputs.long_vacant && inputs.schedule_on_soon && !inputs.recent_ui_use {
                let setback = if is_eco_temperature(wt) {
                    tuning.setback_eco_c
                } else {
                    tuning.setback_default_c
                };
                wt.saturating_sub(setback).max(frost)
            } else {
                frost
            }
        }
        ValveMode::Bake => wt.saturating_add(tuning.bake_uplift_c).min(MAX_TARGET_C),
        ValveMode::Warm => {
            let tier = warm_setback_tier(inputs, tuning);
            wt.saturating_sub(tier.degrees(tuning))
        }
    };
    target.clamp(frost, MAX_TARGET_C)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{DEFAULT_FROST_C, MIN_TARGET_C};

    fn warm(frost_c: u8, warm_c: u8) -> TargetInputs {
        TargetInputs {
            mode: ValveMode::Warm,
            frost_c,
            warm_c,
            ..TargetInputs::default()
        }
    }

    #[test]
    fn frost_mode_returns_frost_target() {
        let tuning = TargetTuning::default();
        let inputs = TargetInputs {
            mode: ValveMode::Frost,
            ..warm(7, 18)
        };
        assert_eq!(compute_target_temp(&inputs, &tuning), 7);
    }

    #[test]
    fn frost_mode_prewarms_before_schedule() {
        let tuning = TargetTuning::default();
        let mut inputs = TargetInputs {
            mode: ValveMode::Frost,
            schedule_on_soon: true,
            ..warm(DEFAULT_FROST_C, 18)
        };
        assert_eq!(compute_target_temp(&inputs, &tuning), 18 - tuning.setback_default_c);

        inputs.warm_c = 16;
        assert_eq!(compute_target_temp(&inputs, &tuning), 16 - tuning.setback_eco_c);

        inputs.recent_ui_use = true;
        assert_eq!(compute_target_temp(&inputs, &tuning), DEFAULT_FROST_C);

        inputs.recent_ui_use = false;
        inputs.long_vacant = true;
        assert_eq!(compute_target_temp(&inputs, &tuning), DEFAULT_FROST_C);
    }

    #[test]
    fn bake_is_uplift_capped_at_max() {
        let tuning = TargetTuning::default();
        for warm_c in MIN_TARGET_C..=MAX_TARGET_C {
            let inputs = TargetInputs {
                mode: ValveMode::Bake,
                long_vacant: true,
                room_dark: true,
                ..warm(MIN_TARGET_C, warm_c)
            };
            assert_eq!(
                compute_target_temp(&inputs, &tuning),
                (warm_c + tuning.bake_uplift_c).min(MAX_TARGET_C)
            );
        }
    }

    #[test]
    fn occupied_or_lit_room_is_not_set_back() {
        let tuning = TargetTuning::default();
        let mut inputs = warm(DEFAULT_FROST_C, 18);
        inputs.room_dark = true;
        inputs.likely_occupied = true;
        assert_eq!(warm_setback_tier(&inputs, &tuning), SetbackTier::None);

        inputs.likely_occupied = false;
        inputs.room_dark = false;
        assert_eq!(compute_target_temp(&inputs, &tuning), 18);
    }

    #[test]
    fn decision_table_tiers() {
        let tuning = TargetTuning::default();
        let dark = TargetInputs {
            room_dark: true,
            ..warm(DEFAULT_FROST_C, 18)
        };
        assert_eq!(warm_setback_tier(&dark, &tuning), SetbackTier::Eco);

        let comfort = TargetInputs { warm_c: 21, ..dark.clone() };
        assert_eq!(warm_setback_tier(&comfort, &tuning), SetbackTier::Default);

        let soon = TargetInputs { schedule_on_soon: true, ..dark.clone() };
        assert_eq!(warm_setback_tier(&soon, &tuning), SetbackTier::Default);

        let lit_history = TargetInputs {
            recently_lit: true,
            occ_pc_this_hour: Some(40),
            ..dark.clone()
        };
        assert_eq!(warm_setback_tier(&lit_history, &tuning), SetbackTier::Default);

        let quiet_hours = TargetInputs {
            occ_pc_this_hour: Some(3),
            occ_pc_next_hour: Some(5),
            warm_c: 17,
            ..dark.clone()
        };
        assert_eq!(warm_setback_tier(&quiet_hours, &tuning), SetbackTier::Full);

        let quiet_but_warm = TargetInputs { warm_c: 18, ..quiet_hours.clone() };
        assert_eq!(warm_setback_tier(&quiet_but_warm, &tuning), SetbackTier::Eco);

        let quiet_long_dark = TargetInputs {
            dark_minutes: 3 * 60,
            vacancy_h: 3,
            ..quiet_but_warm
        };
        assert_eq!(warm_setback_tier(&quiet_long_dark, &tuning), SetbackTier::Full);
    }

    #[test]
    fn long_vacant_eco_dark_room_gets_full_setback() {
        let tuning = TargetTuning::default();
        let inputs = TargetInputs {
            long_vacant: true,
            long_long_vacant: true,
            vacancy_h: 13,
            room_dark: true,
            dark_minutes: 13 * 60,
            ..warm(DEFAULT_FROST_C, 18)
        };
        assert_eq!(
            compute_target_temp(&inputs, &tuning),
            (18 - tuning.setback_full_c).max(DEFAULT_FROST_C)
        );

        let floored = TargetInputs {
            frost_c: 16,
            warm_c: 17,
            ..inputs
        };
        assert_eq!(compute_target_temp(&floored, &tuning), 16);
    }

    #[test]
    fn long_vacant_without_history_or_long_dark_stays_eco() {
        let tuning = TargetTuning::default();
        let inputs = TargetInputs {
            long_vacant: true,
            vacancy_h: 13,
            room_dark: true,
            ..warm(DEFAULT_FROST_C, 18)
        };
        assert_eq!(warm_setback_tier(&inputs, &tuning), SetbackTier::Eco);
        assert_eq!(
            compute_target_temp(&inputs, &tuning),
            18 - tuning.setback_eco_c
        );

        let days_empty = TargetInputs { long_long_vacant: true, vacancy_h: 25, ..inputs };
        assert_eq!(warm_setback_tier(&days_empty, &tuning), SetbackTier::Full);
    }

    #[test]
    fn battery_low_forces_eco_bias() {
        assert!(!has_eco_bias(20, false));
        assert!(has_eco_bias(20, true));
        assert!(has_eco_bias(18, false));
    }

    #[test]
    fn target_always_within_frost_and_max() {
        let tuning = TargetTuning::default();
        let modes = [ValveMode::Frost, ValveMode::Warm, ValveMode::Bake];
        for bits in 0u16..(1 << 10) {
            let flag = |n: u16| bits & (1 << n) != 0;
            for mode in modes {
                for (frost_c, warm_c) in [(5, 5), (6, 18), (10, 12), (16, 17), (20, 25), (25, 25)] {
                    let inputs = TargetInputs {
                        mode,
                        frost_c,
                        warm_c,
                        battery_low: flag(0),
                        likely_occupied: flag(1),
                        long_vacant: flag(2),
                        long_long_vacant: flag(3),
                        vacancy_h: if flag(2) { 100 } else { 0 },
                        room_dark: flag(4),
                        recently_lit: flag(5),
                        dark_minutes: if flag(4) { 600 } else { 0 },
                        occ_pc_this_hour: flag(6).then_some(2),
                        occ_pc_next_hour: flag(6).then_some(50),
                        schedule_on_now: flag(7),
                        schedule_on_soon: flag(8),
                        recent_ui_use: flag(9),
                    };
                    let target = compute_target_temp(&inputs, &tuning);
                    assert!(target >= frost_c && target <= MAX_TARGET_C, "{inputs:?} -> {target}");
                }
            }
        }
    }
}
