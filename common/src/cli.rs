use std::fmt::Write as _;

use crate::{
    error::CliError,
    schedule::SCHEDULE_SLOTS,
    stats::StatsSet,
    types::{StatsTxLevel, ValveMode},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Exit,
    Status,
    Version,
    Frost(Option<u8>),
    Warm(Option<u8>),
    Bake,
    SetTime { hours: u8, minutes: u8 },
    MinBoilerOn(u8),
    HouseCodes(Option<(u8, u8)>),
    MinValveOpen(Option<u8>),
    Dump(StatsSet),
    StatsTxLevel(StatsTxLevel),
    ZapStats,
    DeviceId { regenerate: bool },
    Program { hours: u8, minutes: u8, slot: u8 },
    Learn { slot: u8 },
    Extension(String),
    Help,
}

pub const HELP: &[&str] = &[
    "CLI usage:",
    "E  exit CLI",
    "S  show status",
    "V  show version",
    "F [CC]  FROST, or set FROST target C",
    "W [CC]  WARM, or set WARM target C",
    "Q  BAKE",
    "T HH MM  set time",
    "C M  min boiler on minutes, 0 disables hub",
    "H [h1 h2]  set or clear FHT8V house codes",
    "O [PP]  set or clear min valve % open",
    "D N  dump stats set N",
    "X NN  stats TX privacy level",
    "Z  zap learned stats",
    "I [*]  show or regenerate ID",
    "P HH MM [S]  program schedule slot S",
    "L [S]  learn current state into slot S",
    "+EXT ...  extension command",
];

fn number(arg: &str) -> Result<u8, CliError> {
    arg.parse().map_err(|_| CliError::BadArgs)
}

fn bounded(arg: &str, max: u8) -> Result<u8, CliError> {
    let value = number(arg)?;
    if value > max {
        return Err(CliError::BadArgs);
    }
    Ok(value)
}

fn slot(arg: Option<&&str>) -> Result<u8, CliError> {
    match arg {
        None => Ok(0),
        Some(arg) => bounded(arg, SCHEDULE_SLOTS - 1),
    }
}

pub fn parse(line: &str) -> Result<CliCommand, CliError> {
    let line = line.trim_matches(|c: char| c.is_whitespace() || c.is_control());
    let mut chars = line.chars();
    let command = chars.next().ok_or(CliError::Empty)?;
    let rest = chars.as_str();
    let args: Vec<&str> = rest.split_whitespace().collect();

    let cmd = match (command, args.as_slice()) {
        ('E', []) => CliCommand::Exit,
        ('S', []) => CliCommand::Status,
        ('V', []) => CliCommand::Version,
        ('F', []) => CliCommand::Frost(None),
        ('F', [c]) => CliCommand::Frost(Some(number(c)?)),
        ('W', []) => CliCommand::Warm(None),
        ('W', [c]) => CliCommand::Warm(Some(number(c)?)),
        ('Q', []) => CliCommand::Bake,
        ('T', [h, m]) => CliCommand::SetTime {
            hours: bounded(h, 23)?,
            minutes: bounded(m, 59)?,
        },
        ('C', [m]) => CliCommand::MinBoilerOn(bounded(m, 254)?),
        ('H', []) => CliCommand::HouseCodes(None),
        ('H', [hc1, hc2]) => CliCommand::HouseCodes(Some((bounded(hc1, 99)?, bounded(hc2, 99)?))),
        ('O', []) => CliCommand::MinValveOpen(None),
        ('O', [pc]) => CliCommand::MinValveOpen(Some(bounded(pc, 100)?)),
        ('D', [n]) => {
            CliCommand::Dump(StatsSet::from_index(number(n)?).ok_or(CliError::BadArgs)?)
        }
        ('X', [level]) => CliCommand::StatsTxLevel(StatsTxLevel(number(level)?)),
        ('Z', []) => CliCommand::ZapStats,
        ('I', []) => CliCommand::DeviceId { regenerate: false },
        ('I', ["*"]) => CliCommand::DeviceId { regenerate: true },
        ('P', [h, m, s @ ..]) if s.len() <= 1 => CliCommand::Program {
            hours: bounded(h, 23)?,
            minutes: bounded(m, 59)?,
            slot: slot(s.first())?,
        },
        ('L', [s @ ..]) if s.len() <= 1 => CliCommand::Learn {
            slot: slot(s.first())?,
        },
        ('+', _) if !rest.trim().is_empty() => CliCommand::Extension(rest.trim().to_string()),
        ('?', _) => CliCommand::Help,
        (
            'E' | 'S' | 'V' | 'F' | 'W' | 'Q' | 'T' | 'C' | 'H' | 'O' | 'D' | 'X' | 'Z' | 'I' | 'P'
            | 'L' | '+',
            _,
        ) => return Err(CliError::BadArgs),
        (other, _) => return Err(CliError::Unknown(other)),
    };
    Ok(cmd)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusLine {
    pub mode: ValveMode,
    pub valve_pc: u8,
    pub temp_c16: Option<i16>,
    pub stats_tx_level: Option<StatsTxLevel>,
    pub minutes_since_midnight: u16,
    pub schedule: Vec<Option<(u16, u16)>>,
    pub frost_c: u8,
    pub warm_c: u8,
    pub eco_bias: bool,
    pub hub_min_on_m: Option<u8>,
    pub fht8v: Option<(u8, u8, bool)>,
    pub min_valve_pc_override: Option<u8>,
    pub json: Option<String>,
}

fn hh_mm(minutes: u16) -> String {
    format!("{:02} {:02}", minutes / 60, minutes % 60)
}

impl StatusLine {
    pub fn render(&self) -> String {
        let mut out = format!("={}{}%", self.mode.status_char(), self.valve_pc);
        match self.temp_c16 {
            Some(t) => {
                let _ = write!(out, "@{}C{:x}", t >> 4, t & 0xf);
            }
            None => out.push_str("@?C"),
        }
        if let Some(level) = self.stats_tx_level {
            let _ = write!(out, ";X{}", level.0);
        }
        let _ = write!(out, ";T{}", hh_mm(self.minutes_since_midnight));
        for (on, off) in self.schedule.iter().flatten() {
            let _ = write!(out, " W{} F{}", hh_mm(*on), hh_mm(*off));
        }
        let _ = write!(
            out,
            ";S{} {} {}",
            self.frost_c,
            self.warm_c,
            if self.eco_bias { 'e' } else { 'c' }
        );
        if let Some(minutes) = self.hub_min_on_m {
            let _ = write!(out, ";C{minutes}");
        }
        if let Some((hc1, hc2, synced)) = self.fht8v {
            let _ = write!(out, ";HC{hc1} {hc2}");
            if !synced {
                out.push_str(" s");
            }
        }
        if let Some(pc) = self.min_valve_pc_override {
            let _ = write!(out, ";O{pc}");
        }
        if let Some(json) = &self.json {
            out.push(';');
            out.push_str(json);
        }
        out
    }
}
