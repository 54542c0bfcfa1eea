use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use chrono::Timelike;

use opentrv_common::sensors::{sanitize_temp_c16, Sensor};

use crate::board::Clock;

/// Heating rate with the valve fully open, C per minute.
const HEAT_C_PER_MIN: f32 = 0.15;
/// Fraction of the indoor/outdoor difference lost per minute.
const LOSS_PER_MIN: f32 = 0.01;
/// Largest valve movement the simulated motor makes per command.
const MOTOR_STEP_PC: u8 = 50;

/// Thermal model standing in for the radiator, motor and room on a host.
#[derive(Debug, Clone)]
pub struct Room {
    temp_c: f32,
    outside_c: f32,
    valve_pc: u8,
    humidity_pc: u8,
    pot: u8,
    last_step: Instant,
}

impl Room {
    pub fn new(temp_c: f32, outside_c: f32) -> Self {
        Self {
            temp_c,
            outside_c,
            valve_pc: 0,
            humidity_pc: 45,
            pot: 128,
            last_step: Instant::now(),
        }
    }

    /// Advances the model by `minutes`.
    pub fn advance(&mut self, minutes: f32) {
        let heat = HEAT_C_PER_MIN * f32::from(self.valve_pc) / 100.0;
        let loss = LOSS_PER_MIN * (self.temp_c - self.outside_c);
        self.temp_c += (heat - loss) * minutes;
        let drift = if self.valve_pc > 0 { -1 } else { 1 };
        self.humidity_pc = self.humidity_pc.saturating_add_signed(drift).clamp(35, 60);
    }

    fn catch_up(&mut self) {
        let now = Instant::now();
        let minutes = now.duration_since(self.last_step).as_secs_f32() / 60.0;
        self.last_step = now;
        self.advance(minutes);
    }

    pub fn temp_c16(&self) -> i16 {
        (self.temp_c * 16.0).round() as i16
    }

    pub fn valve_pc(&self) -> u8 {
        self.valve_pc
    }

    /// Moves the valve towards `target` by at most one motor step.
    pub fn drive_valve(&mut self, target: u8) -> u8 {
        let target = target.min(100);
        self.valve_pc = if target > self.valve_pc {
            target.min(self.valve_pc.saturating_add(MOTOR_STEP_PC))
        } else {
            target.max(self.valve_pc.saturating_sub(MOTOR_STEP_PC))
        };
        self.valve_pc
    }
}

pub type SharedRoom = Arc<Mutex<Room>>;

fn with_room<T>(room: &SharedRoom, f: impl FnOnce(&mut Room) -> T) -> T {
    let mut room = room.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut room)
}

pub struct RoomThermometer {
    room: SharedRoom,
    last: i16,
}

impl RoomThermometer {
    pub fn new(room: SharedRoom) -> Self {
        Self { room, last: 0 }
    }
}

impl Sensor for RoomThermometer {
    type Value = i16;

    fn read(&mut self) -> i16 {
        self.last = sanitize_temp_c16(with_room(&self.room, |room| {
            room.catch_up();
            room.temp_c16()
        }));
        self.last
    }

    fn get(&self) -> i16 {
        self.last
    }

    fn tag(&self) -> &'static str {
        "T|C16"
    }
}

pub struct RoomHygrometer {
    room: SharedRoom,
    last: u8,
}

impl RoomHygrometer {
    pub fn new(room: SharedRoom) -> Self {
        Self { room, last: 0 }
    }
}

impl Sensor for RoomHygrometer {
    type Value = u8;

    fn read(&mut self) -> u8 {
        self.last = with_room(&self.room, |room| room.humidity_pc);
        self.last
    }

    fn get(&self) -> u8 {
        self.last
    }

    fn tag(&self) -> &'static str {
        "H|%"
    }
}

/// Daylight from the device clock: bright by day, dim at night.
pub struct DaylightSensor {
    clock: Arc<Clock>,
    last: u8,
}

impl DaylightSensor {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self { clock, last: 0 }
    }
}

impl Sensor for DaylightSensor {
    type Value = u8;

    fn read(&mut self) -> u8 {
        self.last = match self.clock.now().hour() {
            7..=19 => 150,
            6 | 20 => 40,
            _ => 4,
        };
        self.last
    }

    fn get(&self) -> u8 {
        self.last
    }

    fn tag(&self) -> &'static str {
        "L"
    }
}

pub struct TempDial {
    room: SharedRoom,
    last: u8,
}

impl TempDial {
    pub fn new(room: SharedRoom) -> Self {
        Self { room, last: 0 }
    }
}

impl Sensor for TempDial {
    type Value = u8;

    fn read(&mut self) -> u8 {
        self.last = with_room(&self.room, |room| room.pot);
        self.last
    }

    fn get(&self) -> u8 {
        self.last
    }

    fn preferred_poll_interval_s(&self) -> u8 {
        2
    }

    fn tag(&self) -> &'static str {
        "tS|C"
    }
}

/// Mains-powered host: a steady healthy supply.
pub struct MainsSupply;

impl Sensor for MainsSupply {
    type Value = u16;

    fn read(&mut self) -> u16 {
        330
    }

    fn get(&self) -> u16 {
        330
    }

    fn tag(&self) -> &'static str {
        "B|cV"
    }
}

/// Valve motor moving the room model's radiator valve.
pub struct RoomValve {
    room: SharedRoom,
}

impl RoomValve {
    pub fn new(room: SharedRoom) -> Self {
        Self { room }
    }

    pub fn set_percent_open(&mut self, percent_open: u8) -> u8 {
        with_room(&self.room, |room| {
            room.catch_up();
            room.drive_valve(percent_open)
        })
    }

    pub fn is_really_open(&self, min_really_open_pc: u8) -> bool {
        with_room(&self.room, |room| room.valve_pc() >= min_really_open_pc)
    }
}
