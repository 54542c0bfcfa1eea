use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{debug, info, warn};

use opentrv_common::{
    frame::{FullStatsFrame, ValveReport},
    valve::{ModelledRadValve, ValveInputs},
    ValveTuning, TOPIC_RADIO_FRAMES,
};

const DEFAULT_VALVE_ID: u16 = 0x8123;
const DEFAULT_TARGET_C: u8 = 19;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn valve_id() -> u16 {
    std::env::var("VALVE_ID")
        .ok()
        .and_then(|value| u16::from_str_radix(value.trim_start_matches("0x"), 16).ok())
        .unwrap_or(DEFAULT_VALVE_ID)
}

/// Radiator valve head simulated against a simple room, reporting the way
/// a battery valve does.
struct SimulatedValve {
    id: u16,
    tuning: ValveTuning,
    target_c: u8,
    valve: ModelledRadValve,
    temp_c: f32,
    outside_c: f32,
}

impl SimulatedValve {
    fn new(id: u16, target_c: u8) -> Self {
        let tuning = ValveTuning::default();
        Self {
            id,
            valve: ModelledRadValve::new(&tuning),
            tuning,
            target_c,
            temp_c: 16.0,
            outside_c: 6.0,
        }
    }

    fn temp_c16(&self) -> i16 {
        (self.temp_c * 16.0).round() as i16
    }

    /// One control minute: move the valve, then let the room respond.
    fn step(&mut self) -> FullStatsFrame {
        let temp_c16 = self.temp_c16();
        let inputs = ValveInputs::new(&self.tuning, self.target_c, temp_c16);
        let pc = self.valve.read(&inputs);
        let really_open = pc >= self.tuning.min_really_open_pc;

        self.temp_c += 0.15 * f32::from(pc) / 100.0 - 0.01 * (self.temp_c - self.outside_c);

        FullStatsFrame {
            id: Some(self.id),
            temp_c16: Some(temp_c16),
            valve: Some(ValveReport {
                percent_open: pc,
                calling_for_heat: self.valve.is_calling_for_heat(really_open),
            }),
            ext: None,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = env_or("MQTT_PORT", 1883u16);
    let id = valve_id();

    let mut mqtt_options = MqttOptions::new(format!("opentrv-valve-{id:04x}"), mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("valve mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    let interval_s = env_or("REPORT_INTERVAL_S", 60u64).max(1);
    let mut valve = SimulatedValve::new(id, env_or("TARGET_C", DEFAULT_TARGET_C));
    info!("remote valve {id:04x} reporting every {interval_s}s, target {}C", valve.target_c);

    let mut interval = tokio::time::interval(Duration::from_secs(interval_s));
    loop {
        interval.tick().await;
        let frame = valve.step();
        debug!("report {frame:?}");
        mqtt.publish(TOPIC_RADIO_FRAMES, QoS::AtMostOnce, false, frame.encode())
            .await
            .context("failed to publish valve report")?;
    }
}

#[cfg(test)]
mod tests {
    use opentrv_common::frame::{decode_rx, RxFrame};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cold_room_reports_call_for_heat() {
        let mut valve = SimulatedValve::new(0x8123, 19);
        let mut calls = false;
        for _ in 0..10 {
            let frame = valve.step();
            calls |= frame.valve.is_some_and(|v| v.calling_for_heat);
        }
        assert!(calls);
        assert!(valve.temp_c > 16.0);
    }

    #[test]
    fn reports_decode_as_full_stats() {
        let mut valve = SimulatedValve::new(0x8123, 19);
        let frame = valve.step();
        assert_eq!(decode_rx(&frame.encode()), Ok(RxFrame::FullStats(frame)));
        assert_eq!(frame.id, Some(0x8123));
    }

    #[test]
    fn warm_room_closes_valve() {
        let mut valve = SimulatedValve::new(1, 15);
        valve.temp_c = 22.0;
        valve.outside_c = 22.0;
        let mut last = None;
        for _ in 0..60 {
            last = valve.step().valve;
        }
        assert_eq!(
            last,
            Some(ValveReport {
                percent_open: 0,
                calling_for_heat: false
            })
        );
    }
}
