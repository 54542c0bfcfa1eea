pub mod app;
pub mod boiler;
pub mod cli;
pub mod config;
pub mod error;
pub mod fht8v;
pub mod frame;
pub mod light;
pub mod nvstore;
pub mod occupancy;
pub mod platform;
pub mod radio;
pub mod rng;
pub mod schedule;
pub mod sensors;
pub mod stats;
pub mod stats_tx;
pub mod target;
pub mod topics;
pub mod types;
pub mod valve;

pub use app::{OpenTrv, SensorSet};
pub use config::{BoardConfig, BoardProfile, RuntimeConfig, TargetTuning, ValveTuning};
pub use error::{CliError, ConfigError, FrameError, StartupError};
pub use nvstore::{MemNvStore, NvStore, SettingsStore};
pub use platform::{InterruptFlags, Platform};
pub use radio::{ChannelConfig, RadioLink, SecureFrameEncoder};
pub use topics::*;
pub use types::{ModeState, StatsTxLevel, ValveMode};
