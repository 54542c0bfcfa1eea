use sha2::{Digest, Sha256};
use tracing::warn;

use opentrv_common::{
    error::FrameError,
    frame::MAX_SECURE_BODY_LEN,
    nvstore::layout::{DEVICE_ID_LEN, SECRET_KEY_LEN},
    SecureFrameEncoder,
};

const TAG_LEN: usize = 8;

/// Authenticated stats envelope: `type, len, counter(4), body, tag(8)`.
///
/// The tag is a truncated SHA-256 over key, device ID and everything before
/// it. The body travels in clear.
#[derive(Debug, Default)]
pub struct Sha256Seal {
    counter: u32,
}

impl Sha256Seal {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tag(key: &[u8; SECRET_KEY_LEN], device_id: &[u8; DEVICE_ID_LEN], signed: &[u8]) -> [u8; TAG_LEN] {
    let digest = Sha256::new()
        .chain_update(key)
        .chain_update(device_id)
        .chain_update(signed)
        .finalize();
    let mut out = [0u8; TAG_LEN];
    out.copy_from_slice(&digest[..TAG_LEN]);
    out
}

impl SecureFrameEncoder for Sha256Seal {
    fn encode(
        &mut self,
        key: &[u8; SECRET_KEY_LEN],
        device_id: &[u8; DEVICE_ID_LEN],
        frame_type: u8,
        body: &[u8],
    ) -> Result<Vec<u8>, FrameError> {
        if frame_type & 0x80 == 0 {
            return Err(FrameError::Encrypt);
        }
        if body.len() > MAX_SECURE_BODY_LEN {
            return Err(FrameError::TooLong(body.len()));
        }
        let Some(next) = self.counter.checked_add(1) else {
            warn!("secure frame counter exhausted");
            return Err(FrameError::Encrypt);
        };
        self.counter = next;

        let mut frame = Vec::with_capacity(6 + body.len() + TAG_LEN);
        frame.push(frame_type);
        frame.push(body.len() as u8);
        frame.extend_from_slice(&next.to_be_bytes());
        frame.extend_from_slice(body);
        let tag = tag(key, device_id, &frame);
        frame.extend_from_slice(&tag);
        Ok(frame)
    }
}
