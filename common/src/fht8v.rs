use log::{debug, info};

use crate::error::FrameError;

pub const CMD_SET_VALVE: u8 = 0x26;
pub const CMD_SYNC: u8 = 0x2c;

const SYNC_COUNTDOWN: u8 = 241;
const TX_INTERVAL_HALF_S: u8 = 230;
const PREAMBLE: [u8; 6] = [0xcc; 6];
const TERMINATOR: u8 = 0xff;

pub const MIN_ENCODED_LEN: usize = PREAMBLE.len() + (6 + 45 * 4 + 4 + 7) / 8 + 1;
pub const MAX_ENCODED_LEN: usize = PREAMBLE.len() + (6 + 45 * 6 + 4 + 7) / 8 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fht8vMessage {
    pub hc1: u8,
    pub hc2: u8,
    pub command: u8,
    pub extension: u8,
}

impl Fht8vMessage {
    pub fn set_valve(hc1: u8, hc2: u8, percent_open: u8) -> Self {
        Self {
            hc1,
            hc2,
            command: CMD_SET_VALVE,
            extension: percent_to_extension(percent_open),
        }
    }

    pub fn sync(hc1: u8, hc2: u8, countdown: u8) -> Self {
        Self {
            hc1,
            hc2,
            command: CMD_SYNC,
            extension: countdown,
        }
    }

    fn checksum(&self) -> u8 {
        0x0cu8
            .wrapping_add(self.hc1)
            .wrapping_add(self.hc2)
            .wrapping_add(self.command)
            .wrapping_add(self.extension)
    }

    pub fn percent_open(&self) -> Option<u8> {
        (self.command == CMD_SET_VALVE).then(|| extension_to_percent(self.extension))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bits = BitWriter::default();
        bits.bytes.extend_from_slice(&PREAMBLE);
        bits.push_symbol(true);
        for byte in [self.hc1, self.hc2, self.command, self.extension, self.checksum()] {
            for shift in (0..8).rev() {
                bits.push_symbol(byte & (1 << shift) != 0);
            }
            bits.push_symbol(byte.count_ones() % 2 == 1);
        }
        bits.push_symbol(false);
        bits.finish()
    }

    pub fn decode(stream: &[u8]) -> Result<Self, FrameError> {
        let mut reader = BitReader::new(stream);
        loop {
            match reader.symbol()? {
                true => break,
                false => continue,
            }
        }
        let mut bytes = [0u8; 5];
        for byte in &mut bytes {
            for _ in 0..8 {
                *byte = (*byte << 1) | u8::from(reader.symbol()?);
            }
            let parity = reader.symbol()?;
            if parity != (byte.count_ones() % 2 == 1) {
                return Err(FrameError::BadParity);
            }
        }
        let [hc1, hc2, command, extension, checksum] = bytes;
        let message = Self {
            hc1,
            hc2,
            command,
            extension,
        };
        if message.checksum() != checksum {
            return Err(FrameError::BadChecksum);
        }
        Ok(message)
    }
}

pub fn percent_to_extension(percent_open: u8) -> u8 {
    ((u16::from(percent_open.min(100)) * 255 + 50) / 100) as u8
}

pub fn extension_to_percent(extension: u8) -> u8 {
    ((u16::from(extension) * 100 + 127) / 255) as u8
}

#[derive(Debug, Default)]
struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    fn push_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | u8::from(bit);
        self.used += 1;
        if self.used == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.used = 0;
        }
    }

    fn push_symbol(&mut self, one: bool) {
        let half = if one { 3 } else { 2 };
        for _ in 0..half {
            self.push_bit(true);
        }
        for _ in 0..half {
            self.push_bit(false);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        while self.used != 0 {
            self.push_bit(true);
        }
        self.bytes.push(TERMINATOR);
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<bool> {
        let byte = *self.bytes.get(self.pos / 8)?;
        if byte == TERMINATOR && self.pos % 8 == 0 {
            return None;
        }
        Some(byte & (0x80 >> (self.pos % 8)) != 0)
    }

    fn run(&mut self, value: bool) -> usize {
        let mut count = 0;
        while self.peek() == Some(value) {
            self.pos += 1;
            count += 1;
        }
        count
    }

    fn symbol(&mut self) -> Result<bool, FrameError> {
        if self.peek().is_none() {
            return Err(FrameError::Truncated);
        }
        let ones = self.run(true);
        let zeros = self.run(false);
        match (ones, zeros) {
            (2, 2) => Ok(false),
            (3, 3) => Ok(true),
            (_, 0) => Err(FrameError::Truncated),
            _ => Err(FrameError::BadEncoding),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Syncing { countdown: u8 },
    AwaitFirst { half_seconds: u8 },
    Synced { half_seconds: u8 },
}

/// Drives a remote FHT8V valve head over the FS20 carrier.
#[derive(Debug, Clone)]
pub struct Fht8vDriver {
    house_codes: Option<(u8, u8)>,
    state: SyncState,
    last_sent_pc: Option<u8>,
    min_really_open_pc: u8,
}

impl Fht8vDriver {
    pub fn new(house_codes: Option<(u8, u8)>, min_really_open_pc: u8) -> Self {
        Self {
            house_codes,
            state: SyncState::Unsynced,
            last_sent_pc: None,
            min_really_open_pc,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn house_codes(&self) -> Option<(u8, u8)> {
        self.house_codes
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, SyncState::Synced { .. })
    }

    pub fn set_house_codes(&mut self, house_codes: Option<(u8, u8)>) {
        if self.house_codes != house_codes {
            self.house_codes = house_codes;
            self.resync();
        }
    }

    pub fn set_min_really_open_pc(&mut self, pc: u8) {
        self.min_really_open_pc = pc;
    }

    pub fn resync(&mut self) {
        if self.state != SyncState::Unsynced {
            info!("FHT8V resync");
        }
        self.state = SyncState::Unsynced;
        self.last_sent_pc = None;
    }

    pub fn is_really_open(&self) -> bool {
        self.is_synced()
            && self
                .last_sent_pc
                .is_some_and(|pc| pc >= self.min_really_open_pc)
    }

    pub fn poll_half_second(&mut self, valve_pc: u8) -> Option<Vec<u8>> {
        let (hc1, hc2) = self.house_codes?;
        let jitter = hc2 & 7;
        let (next, message) = match self.state {
            SyncState::Unsynced => (SyncState::Syncing { countdown: SYNC_COUNTDOWN }, None),
            SyncState::Syncing { countdown } => {
                let message = (countdown % 2 == 1).then(|| Fht8vMessage::sync(hc1, hc2, countdown - 1));
                let next = if countdown <= 1 {
                    SyncState::AwaitFirst {
                        half_seconds: jitter + 8,
                    }
                } else {
                    SyncState::Syncing {
                        countdown: countdown - 1,
                    }
                };
                (next, message)
            }
            SyncState::AwaitFirst { half_seconds } | SyncState::Synced { half_seconds }
                if half_seconds > 1 =>
            {
                let next = match self.state {
                    SyncState::AwaitFirst { .. } => SyncState::AwaitFirst {
                        half_seconds: half_seconds - 1,
                    },
                    _ => SyncState::Synced {
                        half_seconds: half_seconds - 1,
                    },
                };
                (next, None)
            }
            SyncState::AwaitFirst { .. } | SyncState::Synced { .. } => {
                self.last_sent_pc = Some(valve_pc);
                (
                    SyncState::Synced {
                        half_seconds: TX_INTERVAL_HALF_S + jitter,
                    },
                    Some(Fht8vMessage::set_valve(hc1, hc2, valve_pc)),
                )
            }
        };
        if matches!(self.state, SyncState::AwaitFirst { .. }) && matches!(next, SyncState::Synced { .. }) {
            debug!("FHT8V synced to {hc1} {hc2}");
        }
        self.state = next;
        message.map(|m| m.encode())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn encoded_stream_decodes_back() {
        let message = Fht8vMessage::set_valve(13, 73, 50);
        let stream = message.encode();
        assert!(stream.starts_with(&PREAMBLE));
        assert_eq!(stream.last(), Some(&TERMINATOR));
        assert!((MIN_ENCODED_LEN..=MAX_ENCODED_LEN).contains(&stream.len()));
        assert_eq!(Fht8vMessage::decode(&stream), Ok(message));
        assert_eq!(message.percent_open(), Some(50));
    }

    #[test]
    fn encoded_length_bounds() {
        let zeros = Fht8vMessage {
            hc1: 0,
            hc2: 0,
            command: 0,
            extension: 0xf4,
        };
        assert!(zeros.encode().len() <= MAX_ENCODED_LEN);
        let ones = Fht8vMessage {
            hc1: 0xff,
            hc2: 0xff,
            command: 0xff,
            extension: 0xff,
        };
        assert!(ones.encode().len() >= MIN_ENCODED_LEN);
        assert!(ones.encode().len() <= MAX_ENCODED_LEN);
    }

    #[test]
    fn corrupted_stream_is_rejected() {
        let mut stream = Fht8vMessage::set_valve(1, 2, 100).encode();
        stream[10] ^= 0x30;
        assert!(Fht8vMessage::decode(&stream).is_err());
        assert_eq!(Fht8vMessage::decode(&PREAMBLE), Err(FrameError::Truncated));
    }

    #[test]
    fn percent_extension_mapping() {
        assert_eq!(percent_to_extension(0), 0);
        assert_eq!(percent_to_extension(100), 255);
        for pc in 0..=100 {
            assert_eq!(extension_to_percent(percent_to_extension(pc)), pc);
        }
    }

    #[test]
    fn sync_sequence_then_periodic_valve_commands() {
        let mut driver = Fht8vDriver::new(Some((13, 73)), 15);
        let jitter = 73 & 7;

        assert_eq!(driver.poll_half_second(50), None);
        let mut syncs = 0;
        while matches!(driver.state(), SyncState::Syncing { .. }) {
            if let Some(frame) = driver.poll_half_second(50) {
                let message = Fht8vMessage::decode(&frame).unwrap();
                assert_eq!(message.command, CMD_SYNC);
                assert_eq!(message.extension % 2, 0);
                syncs += 1;
            }
        }
        assert_eq!(syncs, 121);
        assert!(!driver.is_really_open());

        let mut waited = 0;
        let first = loop {
            waited += 1;
            if let Some(frame) = driver.poll_half_second(50) {
                break frame;
            }
        };
        assert_eq!(waited, usize::from(jitter) + 8);
        assert_eq!(Fht8vMessage::decode(&first).unwrap().percent_open(), Some(50));
        assert!(driver.is_synced());
        assert!(driver.is_really_open());

        let mut gap = 0;
        while driver.poll_half_second(10).is_none() {
            gap += 1;
        }
        assert_eq!(gap + 1, usize::from(TX_INTERVAL_HALF_S + jitter));
        assert!(!driver.is_really_open());
    }

    #[test]
    fn no_house_codes_means_silent_and_resync_restarts() {
        let mut driver = Fht8vDriver::new(None, 15);
        assert_eq!(driver.poll_half_second(100), None);
        assert_eq!(driver.state(), SyncState::Unsynced);

        driver.set_house_codes(Some((1, 2)));
        driver.poll_half_second(100);
        assert!(matches!(driver.state(), SyncState::Syncing { .. }));
        driver.resync();
        assert_eq!(driver.state(), SyncState::Unsynced);
    }
}
