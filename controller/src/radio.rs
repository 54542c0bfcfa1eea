use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
        Arc,
    },
};

use rumqttc::{AsyncClient, QoS};
use tracing::{debug, warn};

use opentrv_common::{ChannelConfig, RadioLink, TOPIC_RADIO_FRAMES};

/// Largest frame carried per MQTT message.
pub const MAX_FRAME_LEN: usize = 64;
/// Own frames remembered so that the broker's echo is not taken as RX.
const ECHO_MEMORY: usize = 8;

/// Radio link carried over an MQTT topic shared by every simulated device.
pub struct MqttRadio {
    mqtt: AsyncClient,
    connected: Arc<AtomicBool>,
    incoming: Receiver<Vec<u8>>,
    pending: VecDeque<Vec<u8>>,
    recent_tx: VecDeque<Vec<u8>>,
    listening: bool,
}

impl MqttRadio {
    pub fn new(mqtt: AsyncClient, connected: Arc<AtomicBool>, incoming: Receiver<Vec<u8>>) -> Self {
        Self {
            mqtt,
            connected,
            incoming,
            pending: VecDeque::new(),
            recent_tx: VecDeque::with_capacity(ECHO_MEMORY),
            listening: false,
        }
    }

    fn drain(&mut self) -> bool {
        let mut any = false;
        while let Ok(frame) = self.incoming.try_recv() {
            any = true;
            if !self.listening {
                continue;
            }
            if let Some(pos) = self.recent_tx.iter().position(|sent| *sent == frame) {
                self.recent_tx.remove(pos);
                continue;
            }
            self.pending.push_back(frame);
        }
        any
    }

    fn publish(&mut self, frame: &[u8]) -> bool {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            warn!("refusing to send {} byte frame", frame.len());
            return false;
        }
        if let Err(err) = self
            .mqtt
            .try_publish(TOPIC_RADIO_FRAMES, QoS::AtMostOnce, false, frame.to_vec())
        {
            debug!("radio tx dropped: {err}");
            return false;
        }
        if self.recent_tx.len() == ECHO_MEMORY {
            self.recent_tx.pop_front();
        }
        self.recent_tx.push_back(frame.to_vec());
        true
    }
}

impl RadioLink for MqttRadio {
    fn begin(&mut self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn poll(&mut self) {
        self.drain();
    }

    fn listen(&mut self, on: bool) {
        self.listening = on;
        if !on {
            self.pending.clear();
        }
    }

    fn queue_to_send(&mut self, frame: &[u8], double_tx: bool) -> bool {
        let sent = self.publish(frame);
        if sent && double_tx {
            // a repeat is identical, so the echo filter swallows it too
            self.publish(frame);
        }
        sent
    }

    fn send_raw(&mut self, frame: &[u8]) -> bool {
        self.publish(frame)
    }

    fn take_rx(&mut self) -> Option<Vec<u8>> {
        self.pending.pop_front()
    }

    fn handle_interrupt_simple(&mut self) -> bool {
        self.drain()
    }

    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            name: "mqtt",
            is_fs20: true,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}
