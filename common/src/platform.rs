use std::sync::atomic::{AtomicBool, Ordering};

pub const MAIN_TICK_S: u8 = 2;
pub const SUB_CYCLE_MAX: u8 = 255;
/// Past this sub-cycle time optional work is skipped to avoid an overrun.
pub const NEAR_OVERRUN_THRESHOLD: u8 = SUB_CYCLE_MAX - 16;

pub trait Rtc {
    fn seconds_lsd(&self) -> u8;

    fn minutes_since_midnight(&self) -> u16;

    fn set_time(&mut self, minutes_since_midnight: u16);

    fn sleep_until_interrupt_or_tick(&mut self) -> bool;

    fn persist_time(&mut self) {}
}

pub trait SubCycleTimer {
    fn sub_cycle_time(&self) -> u8;

    fn sleep_until_sub_cycle(&mut self, target: u8);
}

pub trait Watchdog {
    fn reset(&mut self);
}

pub trait BoilerOutput {
    fn set_boiler(&mut self, on: bool);
}

pub trait SerialPort {
    fn read_line(&mut self) -> Option<String>;

    fn write_line(&mut self, line: &str);
}

pub trait ValveActuator {
    fn set_percent_open(&mut self, percent_open: u8);

    fn is_really_open(&self, min_really_open_pc: u8) -> bool;
}

pub trait Platform: Rtc + SubCycleTimer + Watchdog + BoilerOutput + SerialPort + ValveActuator {
    fn entropy(&mut self) -> u8;
}

/// Flags raised from interrupt (or other-thread) context.
///
/// Producers only store; the main loop swaps each flag clear before acting
/// on it, so no event is handled twice.
#[derive(Debug, Default)]
pub struct InterruptFlags {
    mode_button: AtomicBool,
    learn_button: AtomicBool,
    voice: AtomicBool,
    serial_wake: AtomicBool,
    radio: AtomicBool,
}

impl InterruptFlags {
    pub const fn new() -> Self {
        Self {
            mode_button: AtomicBool::new(false),
            learn_button: AtomicBool::new(false),
            voice: AtomicBool::new(false),
            serial_wake: AtomicBool::new(false),
            radio: AtomicBool::new(false),
        }
    }

    pub fn raise_mode_button(&self) {
        self.mode_button.store(true, Ordering::Release);
    }

    pub fn raise_learn_button(&self) {
        self.learn_button.store(true, Ordering::Release);
    }

    pub fn raise_voice(&self) {
        self.voice.store(true, Ordering::Release);
    }

    pub fn raise_serial_wake(&self) {
        self.serial_wake.store(true, Ordering::Release);
    }

    pub fn raise_radio(&self) {
        self.radio.store(true, Ordering::Release);
    }

    pub fn take_mode_button(&self) -> bool {
        self.mode_button.swap(false, Ordering::AcqRel)
    }

    pub fn take_learn_button(&self) -> bool {
        self.learn_button.swap(false, Ordering::AcqRel)
    }

    pub fn take_voice(&self) -> bool {
        self.voice.swap(false, Ordering::AcqRel)
    }

    pub fn take_serial_wake(&self) -> bool {
        self.serial_wake.swap(false, Ordering::AcqRel)
    }

    pub fn take_radio(&self) -> bool {
        self.radio.swap(false, Ordering::AcqRel)
    }
}
