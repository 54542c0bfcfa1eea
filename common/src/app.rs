use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{debug, error, info, warn};

use crate::{
    boiler::{BoilerHub, RemoteCallForHeat},
    cli::{self, CliCommand, StatusLine, HELP},
    config::RuntimeConfig,
    error::{CliError, ConfigError, FrameError, StartupError},
    fht8v::Fht8vDriver,
    frame::{decode_rx, RxFrame, ValveReport},
    light::AmbientLight,
    nvstore::{layout::SECRET_KEY_LEN, NvStore, SettingsStore},
    occupancy::OccupancyTracker,
    platform::{InterruptFlags, Platform, NEAR_OVERRUN_THRESHOLD},
    radio::{RadioLink, SecureFrameEncoder},
    rng::Rng8,
    schedule::{ScheduleEdge, SimpleValveSchedule, SCHEDULE_SLOTS},
    sensors::{
        is_valid_temp_c16, sanitize_temp_c16, ByteSensor, SupplyMonitor, SupplySensor,
        TempPotTracker, TemperatureSensor, BYTE_SENSOR_INVALID, TEMP_C16_INVALID,
    },
    stats::{self, StatsHour, StatsReading, StatsSampler, StatsSet},
    stats_tx::{build_stats_frame, SecureContext, SimpleStatsRotation, StatsSnapshot, StatsTxPolicy},
    target::{compute_target_temp, has_eco_bias, TargetInputs},
    types::{ModeState, StatsTxLevel, ValveMode},
    valve::{ModelledRadValve, ValveInputs},
};

pub const UI_RECENT_M: u8 = 31;
pub const UI_VERY_RECENT_M: u8 = 2;
const CLI_ACTIVE_TICKS: u8 = 30;
const HALF_SECOND_SLOTS: [u8; 3] = [64, 128, 192];

pub struct SensorSet {
    pub temperature: TemperatureSensor,
    pub supply: SupplySensor,
    pub light: Option<ByteSensor>,
    pub humidity: Option<ByteSensor>,
    pub temp_pot: Option<ByteSensor>,
}

#[derive(Debug, Clone, Copy)]
struct Tick {
    lsd: u8,
    second0: bool,
    minutes: u16,
    battery_low: bool,
    conserve_battery: bool,
    minute_count: u8,
}

impl Tick {
    fn hour(&self) -> u8 {
        (self.minutes / 60) as u8
    }
}

#[derive(Debug, Clone, Copy)]
enum Due {
    At(u8),
    Between(u8, u8),
}

impl Due {
    fn matches(self, lsd: u8) -> bool {
        match self {
            Self::At(at) => lsd == at,
            Self::Between(first, last) => (first..=last).contains(&lsd),
        }
    }
}

struct Task<T> {
    due: Due,
    run: fn(&mut T, &Tick),
}

/// The device: every subsystem plus the cooperative loop that drives them.
pub struct OpenTrv<P: Platform, R: RadioLink, N: NvStore> {
    config: RuntimeConfig,
    platform: P,
    radio: R,
    nv: N,
    sensors: SensorSet,
    flags: Arc<InterruptFlags>,
    encoder: Option<Box<dyn SecureFrameEncoder>>,

    rng: Rng8,
    mode: ModeState,
    valve: ModelledRadValve,
    fht8v: Option<Fht8vDriver>,
    hub: BoilerHub,
    occupancy: OccupancyTracker,
    light: AmbientLight,
    supply: SupplyMonitor,
    pot: TempPotTracker,
    schedule: SimpleValveSchedule,
    sampler: StatsSampler,
    rotation: SimpleStatsRotation,

    short_id: u16,
    temp_c16: i16,
    rh_pc: Option<u8>,
    calling_for_heat: bool,
    time_lsd: u8,
    minute_count: u8,
    stats_tx_slot: Option<u8>,
    stats_tx_requested: bool,
    ui_recent_m: u8,
    ui_very_recent_m: u8,
    cli_active_ticks: u8,
}

impl<P: Platform, R: RadioLink, N: NvStore> OpenTrv<P, R, N> {
    const TASKS: [Task<Self>; 13] = [
        Task { due: Due::At(0), run: Self::minute_boundary },
        Task { due: Due::At(2), run: Self::reseed },
        Task { due: Due::At(4), run: Self::read_supply },
        Task { due: Due::At(6), run: Self::choose_stats_tx_slot },
        Task { due: Due::Between(8, 22), run: Self::stats_tx_candidate },
        Task { due: Due::At(46), run: Self::read_voice },
        Task { due: Due::At(48), run: Self::read_temp_pot },
        Task { due: Due::At(50), run: Self::read_humidity },
        Task { due: Due::At(52), run: Self::read_light },
        Task { due: Due::At(54), run: Self::read_temperature },
        Task { due: Due::At(56), run: Self::update_valve },
        Task { due: Due::At(56), run: Self::report_valve },
        Task { due: Due::At(58), run: Self::sample_stats },
    ];

    pub fn new(
        config: RuntimeConfig,
        mut platform: P,
        mut radio: R,
        mut nv: N,
        sensors: SensorSet,
        flags: Arc<InterruptFlags>,
        encoder: Option<Box<dyn SecureFrameEncoder>>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let board = &config.board;
        if board.secure_frames && encoder.is_none() {
            return Err(ConfigError::SecureFramesWithoutEncoder.into());
        }
        if !radio.begin() {
            if board.boiler_hub {
                error!("radio failed to start on a boiler hub");
                return Err(StartupError::RadioInit);
            }
            warn!("radio failed to start, continuing without it");
        }
        radio.listen(board.boiler_hub);

        let resets = nv.bump_reset_count();
        let entropy: Vec<u8> = (0..8).map(|_| platform.entropy()).collect();
        nv.ensure_device_id(&entropy);
        let short_id = nv.short_id();
        info!(
            "{:?} board {:04x} starting, reset {resets}, overruns {}",
            board.profile,
            short_id,
            nv.overrun_count()
        );

        let min_valve_pc = nv
            .min_valve_pc_open_override()
            .unwrap_or(config.valve.min_really_open_pc);
        let fht8v = board
            .fht8v_valve
            .then(|| Fht8vDriver::new(nv.fht8v_house_codes(), min_valve_pc));
        if board.boiler_hub {
            platform.set_boiler(false);
        }

        Ok(Self {
            rng: Rng8::new(platform.entropy() ^ resets),
            mode: ModeState::default(),
            valve: ModelledRadValve::new(&config.valve),
            fht8v,
            hub: BoilerHub::new(Arc::new(RemoteCallForHeat::new(&config.valve))),
            occupancy: OccupancyTracker::new(),
            light: AmbientLight::new(),
            supply: SupplyMonitor::default(),
            pot: TempPotTracker::default(),
            schedule: SimpleValveSchedule::new(config.target.schedule_on_duration_m),
            sampler: StatsSampler::new(),
            rotation: SimpleStatsRotation::new(),
            short_id,
            temp_c16: TEMP_C16_INVALID,
            rh_pc: None,
            calling_for_heat: false,
            time_lsd: platform.seconds_lsd(),
            minute_count: 0,
            stats_tx_slot: None,
            stats_tx_requested: false,
            ui_recent_m: 0,
            ui_very_recent_m: 0,
            cli_active_ticks: 0,
            config,
            platform,
            radio,
            nv,
            sensors,
            flags,
            encoder,
        })
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            self.run_tick();
        }
    }

    /// Sleeps until the next 2 s tick and runs everything due in it.
    pub fn run_tick(&mut self) {
        self.wait_for_tick();
        self.platform.reset();

        let tick = Tick {
            lsd: self.time_lsd,
            second0: self.time_lsd == 0,
            minutes: self.platform.minutes_since_midnight(),
            battery_low: self.supply.is_battery_low(),
            conserve_battery: self.supply.conserve_battery(),
            minute_count: self.minute_count,
        };

        self.handle_buttons();
        self.run_boiler(&tick);
        self.fht8v_slot();

        for task in Self::TASKS.iter().filter(|task| task.due.matches(tick.lsd)) {
            (task.run)(self, &tick);
        }

        if self.fht8v.is_some() {
            for slot in HALF_SECOND_SLOTS {
                self.platform.sleep_until_sub_cycle(slot);
                self.fht8v_slot();
            }
        } else {
            self.poll_io();
        }

        self.service_cli(&tick);
        self.check_overrun();
    }

    fn wait_for_tick(&mut self) {
        while self.platform.seconds_lsd() == self.time_lsd {
            self.poll_io();
            self.platform.sleep_until_interrupt_or_tick();
        }
        self.time_lsd = self.platform.seconds_lsd();
    }

    fn check_overrun(&mut self) {
        let now = self.platform.seconds_lsd();
        if now == self.time_lsd {
            return;
        }
        let count = self.nv.bump_overrun_count();
        if let Some(fht8v) = &mut self.fht8v {
            fht8v.resync();
        }
        warn!("loop overrun at {} (now {now}), {count} total", self.time_lsd);
        self.platform.write_line("!loop overrun");
        self.time_lsd = now;
    }

    fn poll_io(&mut self) {
        if self.flags.take_radio() {
            self.radio.handle_interrupt_simple();
        }
        self.radio.poll();
        while let Some(raw) = self.radio.take_rx() {
            self.handle_rx(&raw);
        }
    }

    fn handle_rx(&mut self, raw: &[u8]) {
        let hub_mode = self.hub_mode();
        let minutes = self.platform.minutes_since_midnight();
        match decode_rx(raw) {
            Ok(RxFrame::FullStats(stats)) => {
                if let (true, Some(id), Some(valve)) = (hub_mode, stats.id, stats.valve) {
                    if self.hub.remote().rx(id, valve.percent_open, minutes) {
                        debug!("call for heat from {id:04x} at {}%", valve.percent_open);
                    }
                }
            }
            Ok(RxFrame::Fht8v(message)) => {
                if let (true, Some(pc)) = (hub_mode, message.percent_open()) {
                    let id = u16::from_be_bytes([message.hc1, message.hc2]);
                    self.hub.remote().rx(id, pc, minutes);
                }
            }
            Ok(RxFrame::Json(value)) => debug!("rx stats {value}"),
            Ok(RxFrame::Secure(frame)) => {
                warn!("cannot authenticate {} byte secure frame", frame.len());
                self.platform.write_line("?RX auth");
            }
            Err(err) => debug!("rx frame dropped: {err}"),
        }
    }

    fn handle_buttons(&mut self) {
        if self.flags.take_mode_button() {
            self.mode.cycle_from_button();
            info!("mode button: {}", self.mode.mode().as_str());
            self.mark_ui_use();
        }
        if self.flags.take_learn_button() {
            self.learn(0);
            self.mark_ui_use();
        }
    }

    fn run_boiler(&mut self, tick: &Tick) {
        let hub_mode = self.hub_mode();
        let min_on = self.nv.min_boiler_on_minutes();
        let events = self.hub.process_calls_for_heat(tick.second0, hub_mode, min_on);
        if self.config.board.boiler_hub && (events.turned_on || events.turned_off) {
            self.platform.set_boiler(self.hub.is_boiler_on());
        }
    }

    fn fht8v_slot(&mut self) {
        let valve_pc = self.valve.value_pc();
        let frame = self
            .fht8v
            .as_mut()
            .and_then(|fht8v| fht8v.poll_half_second(valve_pc));
        if let Some(frame) = frame {
            if !self.radio.send_raw(&frame) {
                warn!("FHT8V frame not sent");
                self.platform.write_line("!TX failed");
            }
        }
        self.poll_io();
    }

    fn minute_boundary(&mut self, tick: &Tick) {
        self.minute_count = self.minute_count.wrapping_add(1);
        self.mode.tick_minute();
        self.occupancy.tick_minute();
        self.light.tick_minute();
        self.ui_recent_m = self.ui_recent_m.saturating_sub(1);
        self.ui_very_recent_m = self.ui_very_recent_m.saturating_sub(1);

        match self.schedule.edge_at(&self.nv, tick.minutes) {
            Some(ScheduleEdge::On) => {
                info!("schedule: WARM");
                self.mode.set_warm_mode(true);
            }
            Some(ScheduleEdge::Off) => {
                info!("schedule: FROST");
                self.mode.set_warm_mode(false);
            }
            None => {}
        }

        self.platform.persist_time();
        if tick.minutes == 0 {
            let (min, max) = stats::min_max(&self.nv, StatsSet::LightSmoothed);
            self.light.set_min_max(min, max);
        }

        self.rotation.put("occ|%", i64::from(self.occupancy.occupancy_pc()), true);
        self.rotation.put("vac|h", i64::from(self.occupancy.vacancy_h()), true);

        if !tick.conserve_battery {
            self.show_status(tick);
        }
    }

    fn reseed(&mut self, tick: &Tick) {
        let entropy = self.platform.entropy();
        self.rng
            .reseed(entropy, tick.minutes as u8, self.temp_c16 as u8);
    }

    fn read_supply(&mut self, tick: &Tick) {
        if tick.minute_count % 4 != 0 && self.supply.centivolts().is_some() {
            return;
        }
        self.supply.record(self.sensors.supply.read());
        if let Some(cv) = self.supply.centivolts() {
            self.rotation.put("B|cV", i64::from(cv), false);
            if self.supply.is_battery_low() {
                warn!("battery low: {cv}cV");
            }
        }
    }

    fn choose_stats_tx_slot(&mut self, tick: &Tick) {
        let every = if tick.conserve_battery { 16 } else { 4 };
        let due = self.stats_tx_requested || tick.minute_count % every == 0;
        self.stats_tx_slot = due.then(|| 8 + 2 * (self.rng.next_u8() & 7));
    }

    fn stats_tx_candidate(&mut self, tick: &Tick) {
        if self.stats_tx_slot != Some(tick.lsd) {
            return;
        }
        self.stats_tx_slot = None;
        self.stats_tx_requested = false;
        self.bare_stats_tx(!tick.conserve_battery);
    }

    fn bare_stats_tx(&mut self, double_tx: bool) {
        let board = &self.config.board;
        let policy = StatsTxPolicy {
            level: self.nv.stats_tx_level(),
            secure: board.secure_frames,
            binary: board.binary_stats,
            fs20_carrier: board.fs20_carrier,
        };
        let snapshot = StatsSnapshot {
            short_id: self.short_id,
            temp_c16: self.temp_c16,
            valve: board.drives_valve().then(|| ValveReport {
                percent_open: self.valve.value_pc(),
                calling_for_heat: self.calling_for_heat,
            }),
            battery_low: self.supply.is_battery_low(),
            occupancy: self.occupancy.two_bit_level(),
            light: self.light.raw(),
        };
        let key = self.nv.secret_key();
        let device_id = self.nv.device_id();
        let secure = self.encoder.as_deref_mut().map(|encoder| SecureContext {
            encoder,
            key,
            device_id,
        });

        match build_stats_frame(&snapshot, &self.rotation, policy, secure) {
            Ok(frame) => {
                if self.radio.queue_to_send(&frame.bytes, double_tx) {
                    frame.sent(&mut self.rotation);
                } else {
                    warn!("stats frame not queued");
                    self.platform.write_line("!TX failed");
                }
            }
            Err(FrameError::NotPermitted) => debug!("stats TX not permitted"),
            Err(err) => {
                warn!("stats TX skipped: {err}");
                self.platform.write_line("!TX failed");
            }
        }
    }

    fn read_voice(&mut self, _tick: &Tick) {
        if self.config.board.voice_sensor && self.flags.take_voice() {
            debug!("voice detected");
            self.occupancy.mark_as_possibly_occupied();
        }
    }

    fn read_temp_pot(&mut self, _tick: &Tick) {
        if !self.config.board.temp_pot {
            return;
        }
        let Some(pot) = &mut self.sensors.temp_pot else {
            return;
        };
        let raw = pot.read();
        if raw == BYTE_SENSOR_INVALID {
            return;
        }
        let event = self.pot.update(raw);
        if !event.moved {
            return;
        }
        match event.mode {
            Some(ValveMode::Frost) => {
                self.mode.set_warm_mode(false);
            }
            Some(ValveMode::Warm) => {
                self.mode.set_warm_mode(true);
            }
            Some(ValveMode::Bake) => self.mode.start_bake(),
            None => {}
        }
        self.mark_ui_use();
    }

    fn read_humidity(&mut self, tick: &Tick) {
        if !self.config.board.humidity_sensor || tick.battery_low {
            return;
        }
        let Some(sensor) = &mut self.sensors.humidity else {
            return;
        };
        let raw = sensor.read();
        self.rh_pc = (raw <= 100).then_some(raw);
        if let Some(rh) = self.rh_pc {
            self.rotation.put("H|%", i64::from(rh), false);
        }
    }

    fn read_light(&mut self, _tick: &Tick) {
        let Some(sensor) = &mut self.sensors.light else {
            return;
        };
        let raw = sensor.read();
        if self.light.update(raw) {
            debug!("lights on");
            self.occupancy.mark_as_possibly_occupied();
        }
        if let Some(raw) = self.light.raw() {
            self.rotation.put("L", i64::from(raw), false);
        }
    }

    fn read_temperature(&mut self, _tick: &Tick) {
        self.temp_c16 = sanitize_temp_c16(self.sensors.temperature.read());
        if self.temp_c16 == TEMP_C16_INVALID {
            warn!("temperature reading unavailable");
            return;
        }
        self.rotation.put("T|C16", i64::from(self.temp_c16), false);
    }

    fn target_inputs(&self, tick: &Tick) -> TargetInputs {
        let hour = tick.hour();
        TargetInputs {
            mode: self.mode.mode(),
            frost_c: self.nv.frost_target_c(),
            warm_c: self.warm_target_c(),
            battery_low: tick.battery_low,
            likely_occupied: self.occupancy.is_likely_occupied(),
            long_vacant: self.occupancy.is_long_vacant(),
            long_long_vacant: self.occupancy.is_long_long_vacant(),
            vacancy_h: self.occupancy.vacancy_h(),
            room_dark: self.light.is_room_dark(),
            recently_lit: self.light.recently_lit(),
            dark_minutes: self.light.dark_minutes(),
            occ_pc_this_hour: stats::get(&self.nv, StatsSet::OccPcSmoothed, StatsHour::Current, hour),
            occ_pc_next_hour: stats::get(&self.nv, StatsSet::OccPcSmoothed, StatsHour::Next, hour),
            schedule_on_now: self.schedule.is_on_now(&self.nv, tick.minutes),
            schedule_on_soon: self.schedule.is_on_soon(
                &self.nv,
                tick.minutes,
                u16::from(self.config.target.prewarm_m),
            ),
            recent_ui_use: self.ui_recent_m > 0,
        }
    }

    fn update_valve(&mut self, tick: &Tick) {
        let tuning = &self.config.target;
        let mut inputs = self.target_inputs(tick);
        let mut target_c = compute_target_temp(&inputs, tuning);
        if self.mode.in_bake_mode()
            && is_valid_temp_c16(self.temp_c16)
            && self.temp_c16 >= i16::from(target_c) << 4
        {
            info!("BAKE target reached");
            self.mode.cancel_bake();
            inputs.mode = self.mode.mode();
            target_c = compute_target_temp(&inputs, tuning);
        }

        let fast = self.ui_very_recent_m > 0;
        let min_pc = self.min_valve_pc_open();
        let mut valve_inputs = ValveInputs::new(&self.config.valve, target_c, self.temp_c16);
        valve_inputs.min_pc_open = min_pc;
        valve_inputs.in_bake_mode = self.mode.in_bake_mode();
        valve_inputs.has_eco_bias = has_eco_bias(inputs.warm_c, tick.battery_low);
        valve_inputs.fast_response = fast;
        valve_inputs.widen_deadband = (self.valve.state().is_filtering()
            || !self.mode.in_warm_mode()
            || !self.light.is_room_lit()
            || self.occupancy.is_long_vacant())
            && !fast;

        let before = self.valve.value_pc();
        let pc = self.valve.read(&valve_inputs);
        if pc != before {
            debug!("valve {before}% -> {pc}% for {target_c}C");
        }

        let really_open = if self.config.board.local_valve {
            self.platform.set_percent_open(pc);
            self.platform.is_really_open(min_pc)
        } else {
            self.fht8v.as_ref().is_some_and(Fht8vDriver::is_really_open)
        };
        self.calling_for_heat = self.config.board.drives_valve() && self.valve.is_calling_for_heat(really_open);
        if self.calling_for_heat && self.hub_mode() {
            self.hub.remote().post_local_call(self.short_id);
        }
    }

    fn report_valve(&mut self, _tick: &Tick) {
        if !self.config.board.drives_valve() {
            return;
        }
        self.rotation.put("v|%", i64::from(self.valve.value_pc()), false);
        self.rotation.put("tT|C", i64::from(self.valve.target_c()), false);
        self.rotation.put(
            "vC|%",
            i64::from(self.valve.state().cumulative_movement_pc()),
            false,
        );
    }

    fn sample_stats(&mut self, tick: &Tick) {
        let mm = tick.minutes % 60;
        let full = mm == 59;
        let half = mm == 29 && self.config.board.half_hour_stats_subsample;
        if !full && !half {
            return;
        }
        let reading = StatsReading {
            temp_c16: self.temp_c16,
            light: self.light.raw(),
            occupancy_pc: self.occupancy.occupancy_pc(),
            rh_pc: self.rh_pc,
        };
        self.sampler
            .sample(&mut self.nv, &reading, full, tick.hour(), &mut self.rng);
    }

    fn service_cli(&mut self, tick: &Tick) {
        if self.flags.take_serial_wake() {
            self.cli_active_ticks = CLI_ACTIVE_TICKS;
        }
        if self.cli_active_ticks == 0 {
            return;
        }
        self.cli_active_ticks -= 1;
        while self.platform.sub_cycle_time() < NEAR_OVERRUN_THRESHOLD {
            let Some(line) = self.platform.read_line() else {
                break;
            };
            self.handle_cli_line(&line, tick);
        }
    }

    fn handle_cli_line(&mut self, line: &str, tick: &Tick) {
        match cli::parse(line) {
            Ok(command) => {
                debug!("cli: {command:?}");
                if self.apply_cli(command, tick) {
                    self.show_status(tick);
                }
            }
            Err(CliError::Empty) => {}
            Err(err) => {
                debug!("cli: {err}");
                for help in HELP {
                    self.platform.write_line(help);
                }
            }
        }
    }

    fn invalid(&mut self) {
        self.platform.write_line("?invalid");
    }

    fn apply_cli(&mut self, command: CliCommand, tick: &Tick) -> bool {
        let board = self.config.board.clone();
        match command {
            CliCommand::Exit => {
                self.cli_active_ticks = 0;
                return false;
            }
            CliCommand::Status => self.stats_tx_requested = true,
            CliCommand::Version => {
                self.platform
                    .write_line(concat!("OpenTRV ", env!("CARGO_PKG_VERSION")));
                return false;
            }
            CliCommand::Frost(None) => {
                self.mode.set_warm_mode(false);
            }
            CliCommand::Warm(None) => {
                self.mode.set_warm_mode(true);
            }
            CliCommand::Frost(Some(c)) => {
                if !board.settable_targets || !self.nv.set_frost_target_c(c) {
                    self.invalid();
                }
            }
            CliCommand::Warm(Some(c)) => {
                if !board.settable_targets || !self.nv.set_warm_target_c(c) {
                    self.invalid();
                }
            }
            CliCommand::Bake => self.mode.start_bake(),
            CliCommand::SetTime { hours, minutes } => {
                self.platform
                    .set_time(u16::from(hours) * 60 + u16::from(minutes));
            }
            CliCommand::MinBoilerOn(minutes) => {
                if !board.boiler_hub || !self.nv.set_min_boiler_on_minutes(minutes) {
                    self.invalid();
                }
            }
            CliCommand::HouseCodes(codes) => {
                if !self.nv.set_fht8v_house_codes(codes) {
                    self.invalid();
                } else if let Some(fht8v) = &mut self.fht8v {
                    fht8v.set_house_codes(codes);
                }
            }
            CliCommand::MinValveOpen(pc) => {
                if !self.nv.set_min_valve_pc_open_override(pc) {
                    self.invalid();
                } else {
                    let min = self.min_valve_pc_open();
                    if let Some(fht8v) = &mut self.fht8v {
                        fht8v.set_min_really_open_pc(min);
                    }
                }
            }
            CliCommand::Dump(set) => {
                let line = stats::dump(&self.nv, set, tick.hour());
                self.platform.write_line(&line);
                return false;
            }
            CliCommand::StatsTxLevel(level) => self.nv.set_stats_tx_level(level),
            CliCommand::ZapStats => {
                stats::zap(&mut self.nv);
            }
            CliCommand::DeviceId { regenerate } => {
                let id = if regenerate {
                    let entropy: Vec<u8> = (0..8).map(|_| self.platform.entropy()).collect();
                    let id = self.nv.regenerate_device_id(&entropy);
                    self.short_id = self.nv.short_id();
                    info!("device ID regenerated");
                    id
                } else {
                    self.nv.device_id()
                };
                let hex: Vec<String> = id.iter().map(|b| format!("{b:02x}")).collect();
                self.platform.write_line(&format!("ID: {}", hex.join(" ")));
                return false;
            }
            CliCommand::Program { hours, minutes, slot } => {
                let start = u16::from(hours) * 60 + u16::from(minutes);
                if !self.schedule.set(&mut self.nv, slot, start) {
                    self.invalid();
                }
            }
            CliCommand::Learn { slot } => self.learn(slot),
            CliCommand::Extension(text) => self.apply_extension(&text),
            CliCommand::Help => {
                for help in HELP {
                    self.platform.write_line(help);
                }
                return false;
            }
        }
        true
    }

    fn apply_extension(&mut self, text: &str) {
        let args: Vec<&str> = text.split_whitespace().collect();
        match args.as_slice() {
            ["K", "B", "*"] => {
                self.nv.set_secret_key(None);
                info!("secret key erased");
            }
            ["K", "B", hex] => match parse_key(hex) {
                Some(key) => {
                    self.nv.set_secret_key(Some(&key));
                    info!("secret key set");
                }
                None => self.invalid(),
            },
            _ => {
                debug!("unhandled extension command {text:?}");
                self.platform.write_line("?ext");
            }
        }
    }

    fn learn(&mut self, slot: u8) {
        if slot >= SCHEDULE_SLOTS {
            return;
        }
        if self.mode.in_warm_mode() {
            let now = self.platform.minutes_since_midnight();
            self.schedule.set(&mut self.nv, slot, now);
        } else {
            self.schedule.clear(&mut self.nv, slot);
        }
    }

    fn mark_ui_use(&mut self) {
        self.ui_recent_m = UI_RECENT_M;
        self.ui_very_recent_m = UI_VERY_RECENT_M;
        self.occupancy.mark_as_occupied();
    }

    fn show_status(&mut self, tick: &Tick) {
        let level = self.nv.stats_tx_level();
        let warm_c = self.warm_target_c();
        let status = StatusLine {
            mode: self.mode.mode(),
            valve_pc: self.valve.value_pc(),
            temp_c16: is_valid_temp_c16(self.temp_c16).then_some(self.temp_c16),
            stats_tx_level: (level != StatsTxLevel::ALWAYS_ALL).then_some(level),
            minutes_since_midnight: self.platform.minutes_since_midnight(),
            schedule: (0..SCHEDULE_SLOTS)
                .map(|slot| self.schedule.slot(&self.nv, slot))
                .collect(),
            frost_c: self.nv.frost_target_c(),
            warm_c,
            eco_bias: has_eco_bias(warm_c, tick.battery_low),
            hub_min_on_m: self
                .config
                .board
                .boiler_hub
                .then(|| self.nv.min_boiler_on_minutes()),
            fht8v: self.fht8v.as_ref().and_then(|fht8v| {
                fht8v
                    .house_codes()
                    .map(|(hc1, hc2)| (hc1, hc2, fht8v.is_synced()))
            }),
            min_valve_pc_override: self.nv.min_valve_pc_open_override(),
            json: Some(self.rotation.snapshot(true).to_string()),
        };
        self.platform.write_line(&status.render());
        self.cli_active_ticks = CLI_ACTIVE_TICKS;
    }

    pub fn hub_mode(&self) -> bool {
        self.config.board.boiler_hub && self.nv.min_boiler_on_minutes() > 0
    }

    pub fn warm_target_c(&self) -> u8 {
        let frost = self.nv.frost_target_c();
        match self.pot.warm_target_c() {
            Some(pot) if self.config.board.temp_pot => pot.max(frost),
            _ => self.nv.warm_target_c(),
        }
    }

    fn min_valve_pc_open(&self) -> u8 {
        self.nv
            .min_valve_pc_open_override()
            .unwrap_or(self.config.valve.min_really_open_pc)
    }

    pub fn time_lsd(&self) -> u8 {
        self.time_lsd
    }

    pub fn mode(&self) -> ValveMode {
        self.mode.mode()
    }

    pub fn valve(&self) -> &ModelledRadValve {
        &self.valve
    }

    pub fn is_calling_for_heat(&self) -> bool {
        self.calling_for_heat
    }

    pub fn hub(&self) -> &BoilerHub {
        &self.hub
    }

    pub fn fht8v(&self) -> Option<&Fht8vDriver> {
        self.fht8v.as_ref()
    }

    pub fn temp_c16(&self) -> i16 {
        self.temp_c16
    }

    pub fn nv(&self) -> &N {
        &self.nv
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn flags(&self) -> &Arc<InterruptFlags> {
        &self.flags
    }
}

fn parse_key(hex: &str) -> Option<[u8; SECRET_KEY_LEN]> {
    if hex.len() != SECRET_KEY_LEN * 2 || !hex.is_ascii() {
        return None;
    }
    let mut key = [0u8; SECRET_KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::{BoardConfig, BoardProfile, DEFAULT_VALVE_PC_SAFER_OPEN},
        fht8v::SyncState,
        frame::FullStatsFrame,
        nvstore::MemNvStore,
        platform::{BoilerOutput, Rtc, SerialPort, SubCycleTimer, ValveActuator, Watchdog},
        radio::ChannelConfig,
        sensors::Sensor,
    };

    #[derive(Default)]
    struct FakeBoard {
        secs: u32,
        sub: u8,
        stall_s: u32,
        boiler: Vec<bool>,
        valve_pc: u8,
        serial_in: VecDeque<String>,
        serial_out: Vec<String>,
    }

    impl Rtc for FakeBoard {
        fn seconds_lsd(&self) -> u8 {
            (self.secs % 60) as u8
        }

        fn minutes_since_midnight(&self) -> u16 {
            ((self.secs / 60) % (24 * 60)) as u16
        }

        fn set_time(&mut self, minutes_since_midnight: u16) {
            self.secs = u32::from(minutes_since_midnight) * 60 + self.secs % 60;
        }

        fn sleep_until_interrupt_or_tick(&mut self) -> bool {
            self.secs += 2;
            self.sub = 0;
            true
        }
    }

    impl SubCycleTimer for FakeBoard {
        fn sub_cycle_time(&self) -> u8 {
            self.sub
        }

        fn sleep_until_sub_cycle(&mut self, target: u8) {
            self.sub = self.sub.max(target);
        }
    }

    impl Watchdog for FakeBoard {
        // Stalling here makes the whole tick late.
        fn reset(&mut self) {
            self.secs += std::mem::take(&mut self.stall_s);
        }
    }

    impl BoilerOutput for FakeBoard {
        fn set_boiler(&mut self, on: bool) {
            self.boiler.push(on);
        }
    }

    impl SerialPort for FakeBoard {
        fn read_line(&mut self) -> Option<String> {
            self.serial_in.pop_front()
        }

        fn write_line(&mut self, line: &str) {
            self.serial_out.push(line.to_string());
        }
    }

    impl ValveActuator for FakeBoard {
        fn set_percent_open(&mut self, percent_open: u8) {
            self.valve_pc = percent_open;
        }

        fn is_really_open(&self, min_really_open_pc: u8) -> bool {
            self.valve_pc >= min_really_open_pc
        }
    }

    impl Platform for FakeBoard {
        fn entropy(&mut self) -> u8 {
            (self.secs as u8).wrapping_mul(31).wrapping_add(7)
        }
    }

    #[derive(Default)]
    struct FakeRadio {
        broken: bool,
        full: bool,
        rx: VecDeque<Vec<u8>>,
        queued: Vec<Vec<u8>>,
        raw: Vec<Vec<u8>>,
    }

    impl RadioLink for FakeRadio {
        fn begin(&mut self) -> bool {
            !self.broken
        }

        fn poll(&mut self) {}

        fn listen(&mut self, _on: bool) {}

        fn queue_to_send(&mut self, frame: &[u8], _double_tx: bool) -> bool {
            if self.full {
                return false;
            }
            self.queued.push(frame.to_vec());
            true
        }

        fn send_raw(&mut self, frame: &[u8]) -> bool {
            self.raw.push(frame.to_vec());
            true
        }

        fn take_rx(&mut self) -> Option<Vec<u8>> {
            self.rx.pop_front()
        }

        fn channel_config(&self) -> ChannelConfig {
            ChannelConfig {
                name: "fake",
                is_fs20: true,
                max_frame_len: 64,
            }
        }
    }

    struct Shared<T> {
        value: Arc<Mutex<T>>,
        tag: &'static str,
    }

    impl<T: Copy + Send> Sensor for Shared<T> {
        type Value = T;

        fn read(&mut self) -> T {
            *self.value.lock().unwrap()
        }

        fn get(&self) -> T {
            *self.value.lock().unwrap()
        }

        fn tag(&self) -> &'static str {
            self.tag
        }
    }

    type App = OpenTrv<FakeBoard, FakeRadio, MemNvStore>;

    struct Rig {
        app: App,
        temp_c16: Arc<Mutex<i16>>,
    }

    fn board(profile: BoardProfile) -> BoardConfig {
        BoardConfig {
            temp_pot: false,
            ..BoardConfig::for_profile(profile)
        }
    }

    fn try_rig(board: BoardConfig, nv: MemNvStore, radio: FakeRadio) -> Result<Rig, StartupError> {
        let temp_c16 = Arc::new(Mutex::new(16 << 4));
        let sensors = SensorSet {
            temperature: Box::new(Shared {
                value: temp_c16.clone(),
                tag: "T|C16",
            }),
            supply: Box::new(Shared {
                value: Arc::new(Mutex::new(330u16)),
                tag: "B|cV",
            }),
            light: None,
            humidity: None,
            temp_pot: None,
        };
        let config = RuntimeConfig {
            board,
            ..RuntimeConfig::default()
        };
        let app = OpenTrv::new(
            config,
            FakeBoard::default(),
            radio,
            nv,
            sensors,
            Arc::new(InterruptFlags::new()),
            None,
        )?;
        Ok(Rig { app, temp_c16 })
    }

    fn rig(board: BoardConfig) -> Rig {
        try_rig(board, MemNvStore::new(), FakeRadio::default()).unwrap()
    }

    impl Rig {
        fn run_minutes(&mut self, minutes: u32) {
            for _ in 0..minutes * 30 {
                self.app.run_tick();
            }
        }

        fn serial_out(&self) -> &[String] {
            &self.app.platform().serial_out
        }
    }

    #[test]
    fn warm_room_below_target_opens_and_calls_for_heat() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.app.mode.set_warm_mode(true);

        rig.run_minutes(1);
        assert_eq!(rig.app.valve().target_c(), 18);
        let first = rig.app.valve().value_pc();
        assert!(first > 0);
        assert!(!rig.app.is_calling_for_heat());

        rig.run_minutes(9);
        assert!(rig.app.valve().value_pc() >= DEFAULT_VALVE_PC_SAFER_OPEN);
        assert_eq!(rig.app.platform().valve_pc, rig.app.valve().value_pc());
        assert!(rig.app.is_calling_for_heat());
    }

    #[test]
    fn frost_mode_targets_frost_and_closes() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.app.mode.set_warm_mode(true);
        rig.run_minutes(10);
        assert!(rig.app.valve().value_pc() > 0);

        rig.app.mode.set_warm_mode(false);
        let mut last = rig.app.valve().value_pc();
        for _ in 0..10 {
            rig.run_minutes(1);
            let pc = rig.app.valve().value_pc();
            assert!(pc <= last);
            last = pc;
        }
        assert_eq!(rig.app.valve().target_c(), rig.app.nv().frost_target_c());
        assert_eq!(rig.app.valve().value_pc(), 0);
        assert!(!rig.app.is_calling_for_heat());
    }

    #[test]
    fn bake_ends_once_its_target_is_met() {
        let mut rig = rig(board(BoardProfile::RadValve));
        let uplift = rig.app.config.target.bake_uplift_c;
        rig.app.mode.start_bake();
        rig.run_minutes(1);
        assert_eq!(rig.app.mode(), ValveMode::Bake);
        assert_eq!(rig.app.valve().target_c(), 18 + uplift);

        *rig.temp_c16.lock().unwrap() = i16::from(18 + uplift) << 4;
        rig.run_minutes(1);
        assert_eq!(rig.app.mode(), ValveMode::Warm);
        assert_eq!(rig.app.valve().target_c(), 18);
    }

    #[test]
    fn cli_sets_frost_target_only_when_valid() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.app.platform_mut().serial_in.push_back("F 10\r".to_string());
        rig.app.flags().raise_serial_wake();
        rig.app.run_tick();
        assert_eq!(rig.app.nv().frost_target_c(), 10);

        rig.app.platform_mut().serial_in.push_back("F 20\r".to_string());
        rig.app.flags().raise_serial_wake();
        rig.app.run_tick();
        assert_eq!(rig.app.nv().frost_target_c(), 10);
        assert!(rig.serial_out().iter().any(|line| line == "?invalid"));
    }

    #[test]
    fn bad_cli_input_prints_help_and_changes_nothing() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.app.platform_mut().serial_in.push_back("Y 1".to_string());
        rig.app.flags().raise_serial_wake();
        rig.app.run_tick();
        assert!(rig.serial_out().iter().any(|line| line == HELP[0]));
        assert_eq!(rig.app.mode(), ValveMode::Frost);
    }

    #[test]
    fn overrun_is_counted_once_and_resynced() {
        let mut nv = MemNvStore::new();
        nv.set_fht8v_house_codes(Some((12, 34)));
        let mut rig = try_rig(board(BoardProfile::SplitValve), nv, FakeRadio::default()).unwrap();
        rig.app.run_tick();
        assert_eq!(rig.app.nv().overrun_count(), 0);

        for _ in 0..80 {
            rig.app.run_tick();
        }
        assert!(rig.app.fht8v().is_some_and(Fht8vDriver::is_synced));
        assert!(!rig.app.radio_mut().raw.is_empty());

        rig.app.platform_mut().stall_s = 2;
        rig.app.run_tick();
        assert_eq!(rig.app.nv().overrun_count(), 1);
        assert_eq!(rig.app.time_lsd(), rig.app.platform().seconds_lsd());
        assert_eq!(rig.app.fht8v().map(Fht8vDriver::state), Some(SyncState::Unsynced));
        assert!(rig.serial_out().iter().any(|line| line == "!loop overrun"));

        rig.app.run_tick();
        assert_eq!(rig.app.nv().overrun_count(), 1);
    }

    fn call_for_heat_frame(percent_open: u8) -> Vec<u8> {
        FullStatsFrame {
            id: Some(0x1234),
            temp_c16: Some(17 << 4),
            valve: Some(ValveReport {
                percent_open,
                calling_for_heat: true,
            }),
            ext: None,
        }
        .encode()
    }

    #[test]
    fn hub_honours_minimum_off_time() {
        let mut rig = rig(board(BoardProfile::BoilerHub));
        rig.app.radio_mut().rx.push_back(call_for_heat_frame(80));
        rig.app.run_tick();
        assert!(!rig.app.hub().is_boiler_on());

        rig.run_minutes(6);
        rig.app.radio_mut().rx.push_back(call_for_heat_frame(80));
        rig.app.run_tick();
        assert!(rig.app.hub().is_boiler_on());
        assert_eq!(rig.app.hub().countdown_ticks(), 5 * 30);
        assert_eq!(rig.app.hub().last_caller(), Some(0x1234));
        assert_eq!(rig.app.platform().boiler.last(), Some(&true));

        rig.run_minutes(6);
        assert!(!rig.app.hub().is_boiler_on());
        assert_eq!(rig.app.platform().boiler.last(), Some(&false));
    }

    #[test]
    fn hub_ignores_barely_open_valves() {
        let mut rig = rig(board(BoardProfile::BoilerHub));
        rig.run_minutes(20);
        rig.app.radio_mut().rx.push_back(call_for_heat_frame(20));
        rig.app.run_tick();
        assert!(!rig.app.hub().is_boiler_on());
    }

    #[test]
    fn stats_are_sent_only_when_permitted() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.run_minutes(5);
        assert!(rig.app.radio_mut().queued.is_empty());

        let mut nv = MemNvStore::new();
        nv.set_stats_tx_level(StatsTxLevel::ALWAYS_ALL);
        let mut rig = try_rig(board(BoardProfile::RadValve), nv, FakeRadio::default()).unwrap();
        rig.run_minutes(5);
        let sent = rig.app.radio_mut().queued.clone();
        assert!(!sent.is_empty());
        match decode_rx(&sent[sent.len() - 1]) {
            Ok(RxFrame::Json(value)) => {
                assert_eq!(value["@"], format!("{:04x}", rig.app.nv().short_id()));
                assert!(value.get("+").is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unqueued_stats_stay_pending() {
        let mut nv = MemNvStore::new();
        nv.set_stats_tx_level(StatsTxLevel::ALWAYS_ALL);
        let full = FakeRadio {
            full: true,
            ..FakeRadio::default()
        };
        let mut rig = try_rig(board(BoardProfile::RadValve), nv, full).unwrap();
        rig.run_minutes(5);
        assert!(rig.app.radio_mut().queued.is_empty());
        assert!(rig.app.rotation.any_changed());
        assert!(rig.serial_out().iter().any(|line| line == "!TX failed"));
    }

    #[test]
    fn startup_rejects_bad_hardware() {
        let broken = FakeRadio {
            broken: true,
            ..FakeRadio::default()
        };
        let result = try_rig(board(BoardProfile::BoilerHub), MemNvStore::new(), broken);
        assert!(matches!(result, Err(StartupError::RadioInit)));

        let broken = FakeRadio {
            broken: true,
            ..FakeRadio::default()
        };
        assert!(try_rig(board(BoardProfile::RadValve), MemNvStore::new(), broken).is_ok());

        let secure = BoardConfig {
            secure_frames: true,
            ..board(BoardProfile::RadValve)
        };
        let result = try_rig(secure, MemNvStore::new(), FakeRadio::default());
        assert!(matches!(
            result,
            Err(StartupError::Config(ConfigError::SecureFramesWithoutEncoder))
        ));
    }

    #[test]
    fn startup_assigns_device_id_and_counts_resets() {
        let rig = rig(board(BoardProfile::RadValve));
        assert!(rig.app.nv().has_valid_device_id());
        assert_eq!(rig.app.nv().read_byte(crate::nvstore::layout::RESET_COUNT), 0);
    }

    #[test]
    fn mode_button_cycles_and_marks_use() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.app.flags().raise_mode_button();
        rig.app.run_tick();
        assert_eq!(rig.app.mode(), ValveMode::Warm);
        assert!(rig.app.occupancy.is_likely_occupied());
        assert_eq!(rig.app.ui_very_recent_m, UI_VERY_RECENT_M);
    }

    #[test]
    fn invalid_temperature_holds_valve_without_calling() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.app.mode.set_warm_mode(true);
        rig.run_minutes(10);
        let held = rig.app.valve().value_pc();
        *rig.temp_c16.lock().unwrap() = TEMP_C16_INVALID;
        rig.run_minutes(2);
        assert_eq!(rig.app.valve().value_pc(), held);
        assert!(!rig.app.is_calling_for_heat());
    }

    #[test]
    fn learn_button_programs_schedule_in_warm() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.app.mode.set_warm_mode(true);
        rig.app.platform_mut().set_time(7 * 60);
        rig.app.flags().raise_learn_button();
        rig.app.run_tick();
        assert_eq!(rig.app.schedule.slot(rig.app.nv(), 0), Some((7 * 60, 8 * 60)));
    }

    #[test]
    fn secret_key_extension_command() {
        let mut rig = rig(board(BoardProfile::RadValve));
        rig.app
            .platform_mut()
            .serial_in
            .push_back("+K B 000102030405060708090a0b0c0d0e0f".to_string());
        rig.app.flags().raise_serial_wake();
        rig.app.run_tick();
        let key = rig.app.nv().secret_key().unwrap();
        assert_eq!(key[15], 0x0f);
    }
}
