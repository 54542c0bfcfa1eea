use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MIN_TARGET_C: u8 = 5;
pub const MAX_TARGET_C: u8 = 25;
pub const TEMP_SCALE_MIN: u8 = 16;
pub const TEMP_SCALE_MID: u8 = 19;
pub const TEMP_SCALE_MAX: u8 = 22;
pub const BIASECO_WARM: u8 = 17;
pub const BIASCOM_WARM: u8 = 21;
pub const DEFAULT_FROST_C: u8 = 6;
pub const DEFAULT_WARM_C: u8 = 18;

pub const DEFAULT_VALVE_PC_MIN_REALLY_OPEN: u8 = 15;
pub const DEFAULT_VALVE_PC_SAFER_OPEN: u8 = 50;
pub const DEFAULT_VALVE_PC_MODERATELY_OPEN: u8 = 67;

pub const DEFAULT_MIN_BOILER_ON_MINS: u8 = 5;

/// Named deployment profiles replacing compile-time feature matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardProfile {
    RadValve,
    SplitValve,
    BoilerHub,
    ValveAndHub,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub profile: BoardProfile,
    pub local_valve: bool,
    pub fht8v_valve: bool,
    pub boiler_hub: bool,
    pub fs20_carrier: bool,
    pub settable_targets: bool,
    pub temp_pot: bool,
    pub voice_sensor: bool,
    pub humidity_sensor: bool,
    pub secure_frames: bool,
    pub binary_stats: bool,
    pub half_hour_stats_subsample: bool,
}

impl BoardConfig {
    pub fn for_profile(profile: BoardProfile) -> Self {
        let base = Self {
            profile,
            local_valve: false,
            fht8v_valve: false,
            boiler_hub: false,
            fs20_carrier: false,
            settable_targets: true,
            temp_pot: false,
            voice_sensor: false,
            humidity_sensor: true,
            secure_frames: false,
            binary_stats: false,
            half_hour_stats_subsample: true,
        };
        match profile {
            BoardProfile::RadValve => Self {
                local_valve: true,
                temp_pot: true,
                ..base
            },
            BoardProfile::SplitValve => Self {
                fht8v_valve: true,
                fs20_carrier: true,
                ..base
            },
            BoardProfile::BoilerHub => Self {
                boiler_hub: true,
                fs20_carrier: true,
                humidity_sensor: false,
                ..base
            },
            BoardProfile::ValveAndHub => Self {
                local_valve: true,
                boiler_hub: true,
                ..base
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.local_valve && !self.fht8v_valve && !self.boiler_hub {
            return Err(ConfigError::NoRole);
        }
        if self.local_valve && self.fht8v_valve {
            return Err(ConfigError::TwoValveActuators);
        }
        if self.fht8v_valve && !self.fs20_carrier {
            return Err(ConfigError::Fht8vWithoutFs20Carrier);
        }
        Ok(())
    }

    pub fn drives_valve(&self) -> bool {
        self.local_valve || self.fht8v_valve
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self::for_profile(BoardProfile::RadValve)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveTuning {
    pub min_really_open_pc: u8,
    pub safer_open_pc: u8,
    pub moderately_open_pc: u8,
    pub max_pc_open: u8,
    pub slew_pc_per_min: u8,
    pub slew_pc_per_min_fast: u8,
    pub glacial: bool,
}

impl Default for ValveTuning {
    fn default() -> Self {
        Self {
            min_really_open_pc: DEFAULT_VALVE_PC_MIN_REALLY_OPEN,
            safer_open_pc: DEFAULT_VALVE_PC_SAFER_OPEN,
            moderately_open_pc: DEFAULT_VALVE_PC_MODERATELY_OPEN,
            max_pc_open: 100,
            slew_pc_per_min: 5,
            slew_pc_per_min_fast: 10,
            glacial: false,
        }
    }
}

impl ValveTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_really_open_pc == 0 || self.min_really_open_pc > self.safer_open_pc {
            return Err(ConfigError::InvalidTuning(
                "min really open must be in 1..=safer open",
            ));
        }
        if self.safer_open_pc > self.moderately_open_pc || self.moderately_open_pc > 100 {
            return Err(ConfigError::InvalidTuning(
                "safer open must not exceed moderately open (<= 100)",
            ));
        }
        if self.max_pc_open < self.min_really_open_pc || self.max_pc_open > 100 {
            return Err(ConfigError::InvalidTuning(
                "max open must be in min really open..=100",
            ));
        }
        if self.slew_pc_per_min == 0 || self.slew_pc_per_min_fast < self.slew_pc_per_min {
            return Err(ConfigError::InvalidTuning(
                "closing slew must be at least the (non-zero) opening slew",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTuning {
    pub setback_default_c: u8,
    pub setback_eco_c: u8,
    pub setback_full_c: u8,
    pub bake_uplift_c: u8,
    pub this_hour_nlo_threshold_eco: u8,
    pub this_hour_nlo_threshold_comfort: u8,
    pub min_vacancy_and_dark_for_full_setback_h: u8,
    pub prewarm_m: u8,
    pub schedule_on_duration_m: u16,
}

impl Default for TargetTuning {
    fn default() -> Self {
        Self {
            setback_default_c: 1,
            setback_eco_c: 3,
            setback_full_c: 4,
            bake_uplift_c: 5,
            this_hour_nlo_threshold_eco: 15,
            this_hour_nlo_threshold_comfort: 12,
            min_vacancy_and_dark_for_full_setback_h: 2,
            prewarm_m: 30,
            schedule_on_duration_m: 60,
        }
    }
}

impl TargetTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.setback_default_c <= self.setback_eco_c
            && self.setback_eco_c <= self.setback_full_c)
        {
            return Err(ConfigError::InvalidTuning(
                "setbacks must satisfy default <= eco <= full",
            ));
        }
        if self.min_vacancy_and_dark_for_full_setback_h == 0 {
            return Err(ConfigError::InvalidTuning(
                "full setback vacancy threshold must be positive",
            ));
        }
        if self.schedule_on_duration_m == 0 || self.schedule_on_duration_m >= 24 * 60 {
            return Err(ConfigError::InvalidTuning(
                "schedule duration must be within one day",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub board: BoardConfig,
    #[serde(default)]
    pub valve: ValveTuning,
    #[serde(default)]
    pub target: TargetTuning,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            board: BoardConfig::default(),
            valve: ValveTuning::default(),
            target: TargetTuning::default(),
            timezone: "Europe/London".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.board.validate()?;
        self.valve.validate()?;
        self.target.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_named_profiles_are_valid() {
        for profile in [
            BoardProfile::RadValve,
            BoardProfile::SplitValve,
            BoardProfile::BoilerHub,
            BoardProfile::ValveAndHub,
        ] {
            assert_eq!(BoardConfig::for_profile(profile).validate(), Ok(()));
        }
    }

    #[test]
    fn rejects_fht8v_without_fs20_carrier() {
        let mut board = BoardConfig::for_profile(BoardProfile::SplitValve);
        board.fs20_carrier = false;
        assert_eq!(board.validate(), Err(ConfigError::Fht8vWithoutFs20Carrier));
    }

    #[test]
    fn rejects_two_actuators_and_no_role() {
        let mut board = BoardConfig::for_profile(BoardProfile::RadValve);
        board.fht8v_valve = true;
        board.fs20_carrier = true;
        assert_eq!(board.validate(), Err(ConfigError::TwoValveActuators));

        board.local_valve = false;
        board.fht8v_valve = false;
        assert_eq!(board.validate(), Err(ConfigError::NoRole));
    }

    #[test]
    fn rejects_closing_slower_than_opening() {
        let tuning = ValveTuning {
            slew_pc_per_min: 10,
            slew_pc_per_min_fast: 5,
            ..ValveTuning::default()
        };
        assert!(matches!(
            tuning.validate(),
            Err(ConfigError::InvalidTuning(_))
        ));
    }

    #[test]
    fn rejects_non_monotonic_setbacks() {
        let tuning = TargetTuning {
            setback_eco_c: 5,
            setback_full_c: 4,
            ..TargetTuning::default()
        };
        assert!(tuning.validate().is_err());
    }

    #[test]
    fn runtime_config_round_trips_through_json() {
        let config = RuntimeConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let parsed: RuntimeConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.board, config.board);
        assert_eq!(parsed.target, config.target);
        assert!(parsed.validate().is_ok());
    }
}
