use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use opentrv_common::{
    platform::{
        BoilerOutput, Rtc, SerialPort, SubCycleTimer, ValveActuator, Watchdog, MAIN_TICK_S,
        SUB_CYCLE_MAX,
    },
    InterruptFlags, Platform, TOPIC_STATUS,
};

use crate::room::RoomValve;

/// Watchdog gap that would have reset a real board.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(8);
const TICK_MS: u64 = MAIN_TICK_S as u64 * 1000;

/// Wake-up sources feeding the main loop's sleep.
#[derive(Debug)]
pub enum Wake {
    Line(String),
    Radio,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedClock {
    offset_s: i64,
}

/// Wall clock in the configured zone, shifted by whatever the user set.
#[derive(Debug)]
pub struct Clock {
    tz: Tz,
    offset_s: AtomicI64,
    path: PathBuf,
}

impl Clock {
    /// Restores a previously saved offset, if any.
    pub fn load(tz: Tz, path: PathBuf) -> Self {
        let saved = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<SavedClock>(&raw).unwrap_or_else(|err| {
                warn!("ignoring unreadable {}: {err}", path.display());
                SavedClock::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => SavedClock::default(),
            Err(err) => {
                warn!("failed to read {}: {err}", path.display());
                SavedClock::default()
            }
        };
        Self {
            tz,
            offset_s: AtomicI64::new(saved.offset_s),
            path,
        }
    }

    pub fn now(&self) -> DateTime<Tz> {
        let offset = TimeDelta::seconds(self.offset_s.load(Ordering::Acquire));
        (Utc::now() + offset).with_timezone(&self.tz)
    }

    fn minutes_since_midnight(&self) -> u16 {
        let now = self.now();
        (now.hour() * 60 + now.minute()) as u16
    }

    /// Shifts the clock so that it reads `minutes_since_midnight` at second 0.
    fn set(&self, minutes_since_midnight: u16) {
        let now = self.now();
        let current_s = i64::from(now.num_seconds_from_midnight());
        let delta = i64::from(minutes_since_midnight) * 60 - current_s;
        self.offset_s.fetch_add(delta, Ordering::AcqRel);
    }

    fn persist(&self) {
        let saved = SavedClock {
            offset_s: self.offset_s.load(Ordering::Acquire),
        };
        let result = serde_json::to_vec(&saved)
            .map_err(std::io::Error::other)
            .and_then(|payload| std::fs::write(&self.path, payload));
        if let Err(err) = result {
            warn!("failed to save clock to {}: {err}", self.path.display());
        }
    }

    /// Milliseconds into the current 2 s tick.
    fn ms_into_tick(&self) -> u64 {
        let now = self.now();
        let millis = u64::from(now.timestamp_subsec_millis().min(999));
        u64::from(now.second() % u32::from(MAIN_TICK_S)) * 1000 + millis
    }
}

/// Host stand-in for the board: chrono clock, console on stdin/stdout,
/// boiler relay in the log and a simulated valve motor.
pub struct HostPlatform {
    clock: Arc<Clock>,
    wake: Receiver<Wake>,
    flags: Arc<InterruptFlags>,
    pending_lines: Vec<String>,
    valve: RoomValve,
    mqtt: Option<AsyncClient>,
    last_kick: Instant,
    boiler_on: bool,
    entropy_state: u64,
}

impl HostPlatform {
    pub fn new(
        clock: Arc<Clock>,
        wake: Receiver<Wake>,
        flags: Arc<InterruptFlags>,
        valve: RoomValve,
        mqtt: Option<AsyncClient>,
    ) -> Self {
        let seed = Utc::now().timestamp_subsec_nanos();
        Self {
            clock,
            wake,
            flags,
            pending_lines: Vec::new(),
            valve,
            mqtt,
            last_kick: Instant::now(),
            boiler_on: false,
            entropy_state: u64::from(seed) | 1,
        }
    }

    fn on_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Line(line) => {
                self.pending_lines.push(line);
                self.flags.raise_serial_wake();
            }
            Wake::Radio => self.flags.raise_radio(),
        }
    }
}

impl Rtc for HostPlatform {
    fn seconds_lsd(&self) -> u8 {
        (self.clock.now().second() as u8) & !1
    }

    fn minutes_since_midnight(&self) -> u16 {
        self.clock.minutes_since_midnight()
    }

    fn set_time(&mut self, minutes_since_midnight: u16) {
        self.clock.set(minutes_since_midnight);
        info!("clock set to {:02}:{:02}", minutes_since_midnight / 60, minutes_since_midnight % 60);
        self.clock.persist();
    }

    fn sleep_until_interrupt_or_tick(&mut self) -> bool {
        let remaining = TICK_MS.saturating_sub(self.clock.ms_into_tick()).max(1);
        match self.wake.recv_timeout(Duration::from_millis(remaining)) {
            Ok(wake) => {
                self.on_wake(wake);
                false
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(Duration::from_millis(remaining));
                true
            }
        }
    }

    fn persist_time(&mut self) {
        self.clock.persist();
    }
}

impl SubCycleTimer for HostPlatform {
    fn sub_cycle_time(&self) -> u8 {
        let scaled = self.clock.ms_into_tick() * (u64::from(SUB_CYCLE_MAX) + 1) / TICK_MS;
        scaled.min(u64::from(SUB_CYCLE_MAX)) as u8
    }

    fn sleep_until_sub_cycle(&mut self, target: u8) {
        let target_ms = u64::from(target) * TICK_MS / (u64::from(SUB_CYCLE_MAX) + 1);
        let now_ms = self.clock.ms_into_tick();
        if target_ms > now_ms {
            std::thread::sleep(Duration::from_millis(target_ms - now_ms));
        }
    }
}

impl Watchdog for HostPlatform {
    fn reset(&mut self) {
        let gap = self.last_kick.elapsed();
        if gap > WATCHDOG_TIMEOUT {
            warn!("watchdog not kicked for {:.1}s", gap.as_secs_f32());
        }
        self.last_kick = Instant::now();
    }
}

impl BoilerOutput for HostPlatform {
    fn set_boiler(&mut self, on: bool) {
        if on != self.boiler_on {
            info!("boiler relay {}", if on { "closed" } else { "open" });
        }
        self.boiler_on = on;
    }
}

impl SerialPort for HostPlatform {
    fn read_line(&mut self) -> Option<String> {
        while let Ok(wake) = self.wake.try_recv() {
            self.on_wake(wake);
        }
        if self.pending_lines.is_empty() {
            None
        } else {
            Some(self.pending_lines.remove(0))
        }
    }

    fn write_line(&mut self, line: &str) {
        print!("{line}\r\n");
        if !line.starts_with('=') {
            return;
        }
        if let Some(mqtt) = &self.mqtt {
            if let Err(err) = mqtt.try_publish(TOPIC_STATUS, QoS::AtMostOnce, true, line.as_bytes().to_vec()) {
                debug!("status publish dropped: {err}");
            }
        }
    }
}

impl ValveActuator for HostPlatform {
    fn set_percent_open(&mut self, percent_open: u8) {
        let now = self.valve.set_percent_open(percent_open);
        if now != percent_open {
            debug!("valve motor at {now}%, heading for {percent_open}%");
        }
    }

    fn is_really_open(&self, min_really_open_pc: u8) -> bool {
        self.valve.is_really_open(min_really_open_pc)
    }
}

impl Platform for HostPlatform {
    fn entropy(&mut self) -> u8 {
        // xorshift over the clock's nanoseconds
        let mut x = self.entropy_state ^ u64::from(Utc::now().timestamp_subsec_nanos());
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.entropy_state = x;
        (x >> 24) as u8
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{mpsc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::room::Room;

    fn clock(name: &str) -> Arc<Clock> {
        let path = std::env::temp_dir().join(format!("opentrv-clock-{name}-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        Arc::new(Clock::load(chrono_tz::Europe::London, path))
    }

    fn platform(name: &str) -> (HostPlatform, mpsc::Sender<Wake>, Arc<InterruptFlags>) {
        let (tx, rx) = mpsc::channel();
        let flags = Arc::new(InterruptFlags::new());
        let room = Arc::new(Mutex::new(Room::new(18.0, 5.0)));
        let platform = HostPlatform::new(clock(name), rx, flags.clone(), RoomValve::new(room), None);
        (platform, tx, flags)
    }

    #[test]
    fn set_time_moves_clock_and_survives_reload() {
        let clock = clock("set");
        clock.set(7 * 60 + 30);
        let minutes = clock.minutes_since_midnight();
        assert!((7 * 60 + 30..=7 * 60 + 31).contains(&minutes), "{minutes}");
        clock.persist();

        let reloaded = Clock::load(chrono_tz::Europe::London, clock.path.clone());
        assert_eq!(
            reloaded.offset_s.load(Ordering::Acquire),
            clock.offset_s.load(Ordering::Acquire)
        );
        let _ = std::fs::remove_file(&clock.path);
    }

    #[test]
    fn seconds_lsd_is_even() {
        let (platform, _tx, _flags) = platform("lsd");
        let lsd = platform.seconds_lsd();
        assert_eq!(lsd % 2, 0);
        assert!(lsd <= 58);
    }

    #[test]
    fn console_line_wakes_early_and_is_queued() {
        let (mut platform, tx, flags) = platform("line");
        tx.send(Wake::Line("S".to_string())).unwrap();
        assert!(!platform.sleep_until_interrupt_or_tick());
        assert!(flags.take_serial_wake());
        tx.send(Wake::Line("V".to_string())).unwrap();
        assert_eq!(platform.read_line().as_deref(), Some("S"));
        assert_eq!(platform.read_line().as_deref(), Some("V"));
        assert_eq!(platform.read_line(), None);
    }

    #[test]
    fn radio_wake_raises_flag() {
        let (mut platform, tx, flags) = platform("radio");
        tx.send(Wake::Radio).unwrap();
        assert!(!platform.sleep_until_interrupt_or_tick());
        assert!(flags.take_radio());
    }
}
