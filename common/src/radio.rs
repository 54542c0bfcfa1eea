use crate::{
    error::FrameError,
    nvstore::layout::{DEVICE_ID_LEN, SECRET_KEY_LEN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: &'static str,
    pub is_fs20: bool,
    pub max_frame_len: usize,
}

pub trait RadioLink: Send {
    fn begin(&mut self) -> bool;

    fn poll(&mut self);

    fn listen(&mut self, on: bool);

    fn queue_to_send(&mut self, frame: &[u8], double_tx: bool) -> bool;

    fn send_raw(&mut self, frame: &[u8]) -> bool;

    fn take_rx(&mut self) -> Option<Vec<u8>>;

    fn handle_interrupt_simple(&mut self) -> bool {
        false
    }

    fn channel_config(&self) -> ChannelConfig;
}

/// Authenticated-encryption envelope for stats frames.
///
/// Implementations carry their own tag and message counter. Output must
/// start with a type byte that has its top bit set.
pub trait SecureFrameEncoder: Send {
    fn encode(
        &mut self,
        key: &[u8; SECRET_KEY_LEN],
        device_id: &[u8; DEVICE_ID_LEN],
        frame_type: u8,
        body: &[u8],
    ) -> Result<Vec<u8>, FrameError>;
}
