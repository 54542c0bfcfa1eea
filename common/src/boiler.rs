use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use log::{debug, info};

use crate::config::ValveTuning;

pub const TICKS_PER_MINUTE: u16 = 30;
const CYCLE_WINDOW_M: u16 = 64;
const ENCOURAGE_ON_M: u16 = 8;
const CONSIDER_PAUSE_M: u16 = 8;

const HEARD: u32 = 1 << 16;

/// Single-slot mailbox from the radio receive path to the main loop.
///
/// The producer only ever stores, so it never blocks. The consumer swaps the
/// slot empty, so each call is seen at most once.
#[derive(Debug, Default)]
pub struct CallForHeatCell {
    slot: AtomicU32,
}

impl CallForHeatCell {
    pub const fn new() -> Self {
        Self {
            slot: AtomicU32::new(0),
        }
    }

    pub fn post(&self, id: u16) {
        self.slot.store(HEARD | u32::from(id), Ordering::Release);
    }

    pub fn take(&self) -> Option<u16> {
        let raw = self.slot.swap(0, Ordering::AcqRel);
        (raw & HEARD != 0).then_some(raw as u16)
    }
}

/// Receive-side half of the boiler hub, shared with the radio path.
#[derive(Debug)]
pub struct RemoteCallForHeat {
    call: CallForHeatCell,
    boiler_on: AtomicBool,
    safer_open_pc: u8,
    moderately_open_pc: u8,
}

impl RemoteCallForHeat {
    pub fn new(tuning: &ValveTuning) -> Self {
        Self {
            call: CallForHeatCell::new(),
            boiler_on: AtomicBool::new(false),
            safer_open_pc: tuning.safer_open_pc,
            moderately_open_pc: tuning.moderately_open_pc,
        }
    }

    pub fn threshold_pc(&self, minutes_since_midnight: u16) -> u8 {
        let cycle = minutes_since_midnight % CYCLE_WINDOW_M;
        let encourage_on = cycle < ENCOURAGE_ON_M;
        let consider_pause = cycle >= CYCLE_WINDOW_M - CONSIDER_PAUSE_M;
        let raised = self.moderately_open_pc.saturating_sub(1).max(self.safer_open_pc);
        let lowered = self.safer_open_pc;
        if self.is_boiler_on() {
            if consider_pause {
                raised
            } else {
                lowered
            }
        } else if encourage_on {
            lowered
        } else {
            raised
        }
    }

    pub fn rx(&self, id: u16, percent_open: u8, minutes_since_midnight: u16) -> bool {
        if percent_open < self.threshold_pc(minutes_since_midnight) {
            return false;
        }
        self.call.post(id);
        true
    }

    pub fn post_local_call(&self, id: u16) {
        self.call.post(id);
    }

    pub fn is_boiler_on(&self) -> bool {
        self.boiler_on.load(Ordering::Acquire)
    }

    fn set_boiler_on(&self, on: bool) {
        self.boiler_on.store(on, Ordering::Release);
    }

    fn take_call(&self) -> Option<u16> {
        self.call.take()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoilerEvents {
    pub turned_on: bool,
    pub turned_off: bool,
}

#[derive(Debug)]
pub struct BoilerHub {
    remote: Arc<RemoteCallForHeat>,
    countdown_ticks: u16,
    no_call_m: u8,
    last_caller: Option<u16>,
}

impl BoilerHub {
    pub fn new(remote: Arc<RemoteCallForHeat>) -> Self {
        Self {
            remote,
            countdown_ticks: 0,
            no_call_m: 0,
            last_caller: None,
        }
    }

    pub fn remote(&self) -> &Arc<RemoteCallForHeat> {
        &self.remote
    }

    pub fn is_boiler_on(&self) -> bool {
        self.countdown_ticks > 0
    }

    pub fn countdown_ticks(&self) -> u16 {
        self.countdown_ticks
    }

    pub fn no_call_minutes(&self) -> u8 {
        self.no_call_m
    }

    pub fn last_caller(&self) -> Option<u16> {
        self.last_caller
    }

    /// Runs once per main loop tick. `second0` marks the first tick of a minute.
    pub fn process_calls_for_heat(
        &mut self,
        second0: bool,
        hub_mode: bool,
        min_on_minutes: u8,
    ) -> BoilerEvents {
        let was_on = self.is_boiler_on();
        let call = self.remote.take_call();

        if !hub_mode {
            self.countdown_ticks = 0;
        } else {
            if was_on {
                self.countdown_ticks -= 1;
            }
            if let Some(id) = call {
                if !was_on && self.no_call_m < min_on_minutes {
                    debug!("call for heat from {id:04x} ignored, boiler off only {}m", self.no_call_m);
                } else {
                    self.countdown_ticks = u16::from(min_on_minutes) * TICKS_PER_MINUTE;
                    self.no_call_m = 0;
                    self.last_caller = Some(id);
                }
            }
        }

        let on = self.is_boiler_on();
        self.remote.set_boiler_on(on);
        let events = BoilerEvents {
            turned_on: !was_on && on,
            turned_off: was_on && !on,
        };
        if events.turned_on {
            info!("boiler on");
        } else if events.turned_off {
            info!("boiler off");
        }
        if second0 {
            self.no_call_m = self.no_call_m.saturating_add(1);
        }
        events
    }
}
