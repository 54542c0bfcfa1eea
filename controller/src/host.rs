use std::{
    io::{BufRead, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tracing::{error, info, warn};

use opentrv_common::{
    sensors::ByteSensor, InterruptFlags, OpenTrv, RuntimeConfig, SecureFrameEncoder, SensorSet, TOPIC_RADIO_FRAMES,
};

use crate::{
    board::{Clock, HostPlatform, Wake},
    nvfile::FileNvStore,
    radio::{MqttRadio, MAX_FRAME_LEN},
    room::{DaylightSensor, MainsSupply, Room, RoomHygrometer, RoomThermometer, RoomValve, TempDial},
    seal::Sha256Seal,
};

const CONNECT_WAIT: Duration = Duration::from_secs(5);

fn data_dir() -> PathBuf {
    std::env::var("OPENTRV_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.opentrv"))
}

fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let runtime = load_runtime_config(&data_dir.join("runtime.json")).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    let tz = runtime.timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!("unknown timezone {}, using Europe/London", runtime.timezone);
        chrono_tz::Europe::London
    });

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);
    let mut mqtt_options = MqttOptions::new("opentrv-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    mqtt.subscribe(TOPIC_RADIO_FRAMES, QoS::AtMostOnce).await?;

    let flags = Arc::new(InterruptFlags::new());
    let connected = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = mpsc::channel();
    let (frame_tx, frame_rx) = mpsc::channel();
    spawn_mqtt_loop(eventloop, connected.clone(), frame_tx, wake_tx.clone());
    spawn_console_reader(wake_tx);
    wait_for_connection(&connected).await;

    let clock = Arc::new(Clock::load(tz, data_dir.join("clock.json")));
    let room = Arc::new(Mutex::new(Room::new(17.0, 6.0)));
    let board = &runtime.board;
    let sensors = SensorSet {
        temperature: Box::new(RoomThermometer::new(room.clone())),
        supply: Box::new(MainsSupply),
        light: Some(Box::new(DaylightSensor::new(clock.clone()))),
        humidity: board
            .humidity_sensor
            .then(|| Box::new(RoomHygrometer::new(room.clone())) as ByteSensor),
        temp_pot: board
            .temp_pot
            .then(|| Box::new(TempDial::new(room.clone())) as ByteSensor),
    };
    let encoder = board
        .secure_frames
        .then(|| Box::new(Sha256Seal::new()) as Box<dyn SecureFrameEncoder>);

    let nv = FileNvStore::open(data_dir.join("eeprom.bin"))?;
    let platform = HostPlatform::new(
        clock,
        wake_rx,
        flags.clone(),
        RoomValve::new(room),
        Some(mqtt.clone()),
    );
    let radio = MqttRadio::new(mqtt, connected, frame_rx);
    let mut app = OpenTrv::new(runtime, platform, radio, nv, sensors, flags, encoder).map_err(|err| {
        error!("startup failed: {err}");
        err
    })?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            stop_on_signal.store(true, Ordering::Release);
        }
    });

    info!("controller running, data in {}", data_dir.display());
    tokio::task::spawn_blocking(move || app.run(&stop))
        .await
        .context("main loop panicked")?;
    Ok(())
}

fn spawn_mqtt_loop(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    frames: Sender<Vec<u8>>,
    wake: Sender<Wake>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.topic != TOPIC_RADIO_FRAMES {
                        continue;
                    }
                    if message.payload.len() > MAX_FRAME_LEN {
                        warn!("dropping {} byte radio frame", message.payload.len());
                        continue;
                    }
                    if frames.send(message.payload.to_vec()).is_err() {
                        break;
                    }
                    let _ = wake.send(Wake::Radio);
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    connected.store(true, Ordering::Release);
                }
                Ok(_) => {}
                Err(err) => {
                    connected.store(false, Ordering::Release);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_console_reader(wake: Sender<Wake>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if wake.send(Wake::Line(line)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("console read error: {err}");
                    break;
                }
            }
        }
    });
}

async fn wait_for_connection(connected: &AtomicBool) {
    let deadline = tokio::time::Instant::now() + CONNECT_WAIT;
    while !connected.load(Ordering::Acquire) {
        if tokio::time::Instant::now() >= deadline {
            warn!("mqtt not connected after {}s, radio starts offline", CONNECT_WAIT.as_secs());
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use opentrv_common::BoardProfile;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_runtime_config_falls_back_to_default() {
        let path = std::env::temp_dir().join("opentrv-no-such-dir/runtime.json");
        let runtime = load_runtime_config(&path).unwrap();
        assert_eq!(runtime.board.profile, BoardProfile::RadValve);
        assert_eq!(runtime.timezone, "Europe/London");
    }

    #[test]
    fn runtime_config_is_read_from_json() {
        let path = std::env::temp_dir().join(format!("opentrv-runtime-{}.json", std::process::id()));
        let mut runtime = RuntimeConfig::default();
        runtime.board = opentrv_common::BoardConfig::for_profile(BoardProfile::BoilerHub);
        std::fs::write(&path, serde_json::to_vec(&runtime).unwrap()).unwrap();

        let loaded = load_runtime_config(&path).unwrap();
        assert_eq!(loaded.board, runtime.board);

        std::fs::write(&path, b"{not json").unwrap();
        assert!(load_runtime_config(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
