use log::debug;
use serde_json::Value;

use crate::{error::FrameError, fht8v::Fht8vMessage};

pub const FS20_PREFIX: [u8; 3] = [0xcc; 3];
const FHT8V_MIN_PREAMBLE: usize = 6;
pub const MAX_JSON_LEN: usize = 56;

pub const FULL_STATS_HEADER: u8 = 0x60;
const FULL_STATS_HEADER_MASK: u8 = 0xf0;
const FLAG_ID: u8 = 0x08;
const FLAG_TEMP: u8 = 0x04;
const FLAG_VALVE: u8 = 0x02;
const FLAG_EXT: u8 = 0x01;
const VALVE_CALLING_FOR_HEAT: u8 = 0x80;
const BINARY_CRC_SEED: u8 = 0x7f;

pub const SECURE_STATS_TYPE: u8 = 0x80 | b'O';
/// Largest plaintext body handed to a secure envelope, leaving room for
/// its header, counter and tag.
pub const MAX_SECURE_BODY_LEN: usize = 48;

pub fn crc7_5b_update(mut crc: u8, datum: u8) -> u8 {
    let mut mask = 0x80u8;
    while mask != 0 {
        let mut bit = crc & 0x40 != 0;
        if datum & mask != 0 {
            bit = !bit;
        }
        crc <<= 1;
        if bit {
            crc ^= 0x37;
        }
        mask >>= 1;
    }
    crc & 0x7f
}

/// CRC over `bytes`, mapped so that it is never zero on the wire.
pub fn crc7(seed: u8, bytes: &[u8]) -> u8 {
    match bytes.iter().fold(seed, |crc, b| crc7_5b_update(crc, *b)) {
        0 => 0x80,
        crc => crc,
    }
}

pub fn frame_json(json: &str) -> Result<Vec<u8>, FrameError> {
    let bytes = json.as_bytes();
    if bytes.len() > MAX_JSON_LEN {
        return Err(FrameError::TooLong(MAX_JSON_LEN));
    }
    if bytes.first() != Some(&b'{') || bytes.last() != Some(&b'}') || !json.is_ascii() {
        return Err(FrameError::BadJson);
    }
    let mut frame = bytes.to_vec();
    if let Some(last) = frame.last_mut() {
        *last |= 0x80;
    }
    frame.push(crc7(0, &frame));
    Ok(frame)
}

pub fn unframe_json(frame: &[u8]) -> Result<String, FrameError> {
    let (crc, body) = frame.split_last().ok_or(FrameError::Empty)?;
    if body.len() < 2 {
        return Err(FrameError::Truncated);
    }
    if body[0] != b'{' || body[body.len() - 1] != (b'}' | 0x80) {
        return Err(FrameError::BadJson);
    }
    if crc7(0, body) != *crc {
        return Err(FrameError::BadCrc);
    }
    let mut text = body.to_vec();
    let last = text.len() - 1;
    text[last] = b'}';
    String::from_utf8(text).map_err(|_| FrameError::BadJson)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveReport {
    pub percent_open: u8,
    pub calling_for_heat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtStats {
    pub battery_low: bool,
    pub occupancy: u8,
    pub light: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullStatsFrame {
    pub id: Option<u16>,
    pub temp_c16: Option<i16>,
    pub valve: Option<ValveReport>,
    pub ext: Option<ExtStats>,
}

impl FullStatsFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0;
        let mut frame = vec![0];
        if let Some(id) = self.id {
            flags |= FLAG_ID;
            frame.extend_from_slice(&id.to_be_bytes());
        }
        if let Some(temp_c16) = self.temp_c16 {
            flags |= FLAG_TEMP;
            frame.extend_from_slice(&temp_c16.to_be_bytes());
        }
        if let Some(valve) = self.valve {
            flags |= FLAG_VALVE;
            let calling = if valve.calling_for_heat { VALVE_CALLING_FOR_HEAT } else { 0 };
            frame.push(valve.percent_open.min(100) | calling);
        }
        if let Some(ext) = self.ext {
            flags |= FLAG_EXT;
            frame.push(u8::from(ext.battery_low) | ((ext.occupancy & 3) << 1));
            frame.push(ext.light);
        }
        frame[0] = FULL_STATS_HEADER | flags;
        frame.push(crc7(BINARY_CRC_SEED, &frame));
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (crc, body) = frame.split_last().ok_or(FrameError::Empty)?;
        let header = *body.first().ok_or(FrameError::Truncated)?;
        if header & FULL_STATS_HEADER_MASK != FULL_STATS_HEADER {
            return Err(FrameError::BadHeader(header));
        }
        if crc7(BINARY_CRC_SEED, body) != *crc {
            return Err(FrameError::BadCrc);
        }

        let mut cursor = Cursor { rest: &body[1..] };
        let mut stats = Self::default();
        if header & FLAG_ID != 0 {
            stats.id = Some(u16::from_be_bytes(cursor.take()?));
        }
        if header & FLAG_TEMP != 0 {
            stats.temp_c16 = Some(i16::from_be_bytes(cursor.take()?));
        }
        if header & FLAG_VALVE != 0 {
            let [b] = cursor.take()?;
            stats.valve = Some(ValveReport {
                percent_open: (b & !VALVE_CALLING_FOR_HEAT).min(100),
                calling_for_heat: b & VALVE_CALLING_FOR_HEAT != 0,
            });
        }
        if header & FLAG_EXT != 0 {
            let [flags, light] = cursor.take()?;
            stats.ext = Some(ExtStats {
                battery_low: flags & 1 != 0,
                occupancy: (flags >> 1) & 3,
                light,
            });
        }
        if !cursor.rest.is_empty() {
            return Err(FrameError::TooLong(body.len()));
        }
        Ok(stats)
    }
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let (head, tail) = self
            .rest
            .split_first_chunk::<N>()
            .ok_or(FrameError::Truncated)?;
        self.rest = tail;
        Ok(*head)
    }
}

pub fn with_carrier_prefix(frame: Vec<u8>, fs20_carrier: bool) -> Vec<u8> {
    if !fs20_carrier {
        return frame;
    }
    let mut out = Vec::with_capacity(FS20_PREFIX.len() + frame.len());
    out.extend_from_slice(&FS20_PREFIX);
    out.extend(frame);
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum RxFrame {
    Fht8v(Fht8vMessage),
    FullStats(FullStatsFrame),
    Json(Value),
    Secure(Vec<u8>),
}

/// Classifies and parses a raw received frame.
pub fn decode_rx(raw: &[u8]) -> Result<RxFrame, FrameError> {
    if raw.is_empty() {
        return Err(FrameError::Empty);
    }
    let leading_cc = raw.iter().take_while(|b| **b == 0xcc).count();
    if leading_cc >= FHT8V_MIN_PREAMBLE {
        return Fht8vMessage::decode(raw).map(RxFrame::Fht8v);
    }
    let frame = &raw[leading_cc.min(FS20_PREFIX.len())..];
    let header = *frame.first().ok_or(FrameError::Truncated)?;
    match header {
        b'{' => {
            let text = unframe_json(frame)?;
            let value = serde_json::from_str(&text).map_err(|_| FrameError::BadJson)?;
            Ok(RxFrame::Json(value))
        }
        h if h & FULL_STATS_HEADER_MASK == FULL_STATS_HEADER => {
            FullStatsFrame::decode(frame).map(RxFrame::FullStats)
        }
        h if h & 0x80 != 0 => {
            debug!("secure frame type 0x{h:02x}, {} bytes", frame.len());
            Ok(RxFrame::Secure(frame.to_vec()))
        }
        h => Err(FrameError::BadHeader(h)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn crc_is_never_zero() {
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                assert_ne!(crc7(0, &[a, b]), 0);
            }
        }
    }

    #[test]
    fn crc_detects_single_bit_flips() {
        let data = b"{\"T|C16\":300}";
        let crc = crc7(0, data);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.to_vec();
                flipped[i] ^= 1 << bit;
                assert_ne!(crc7(0, &flipped), crc);
            }
        }
    }

    #[test]
    fn json_framing() {
        let frame = frame_json("{\"b\":1}").unwrap();
        assert_eq!(frame[frame.len() - 2], b'}' | 0x80);
        assert_eq!(unframe_json(&frame).unwrap(), "{\"b\":1}");

        let mut corrupted = frame.clone();
        corrupted[2] ^= 0x01;
        assert_eq!(unframe_json(&corrupted), Err(FrameError::BadCrc));

        assert_eq!(frame_json("[1]"), Err(FrameError::BadJson));
        assert_eq!(frame_json("{\"t\":\"\u{e9}\"}"), Err(FrameError::BadJson));
        let long = format!("{{\"x\":\"{}\"}}", "a".repeat(MAX_JSON_LEN));
        assert_eq!(frame_json(&long), Err(FrameError::TooLong(MAX_JSON_LEN)));
    }

    #[test]
    fn full_stats_frame_fields() {
        let stats = FullStatsFrame {
            id: Some(0x8a3c),
            temp_c16: Some(-(3 << 4)),
            valve: Some(ValveReport {
                percent_open: 67,
                calling_for_heat: true,
            }),
            ext: Some(ExtStats {
                battery_low: true,
                occupancy: 2,
                light: 99,
            }),
        };
        let frame = stats.encode();
        assert_eq!(frame[0], 0x6f);
        assert_eq!(frame.len(), 1 + 2 + 2 + 1 + 2 + 1);
        assert_eq!(FullStatsFrame::decode(&frame), Ok(stats));

        let valve_only = FullStatsFrame {
            valve: Some(ValveReport {
                percent_open: 30,
                calling_for_heat: false,
            }),
            ..FullStatsFrame::default()
        };
        assert_eq!(valve_only.encode()[..2], [0x62, 30]);
    }

    #[test]
    fn full_stats_rejects_damage() {
        let frame = FullStatsFrame {
            temp_c16: Some(300),
            ..FullStatsFrame::default()
        }
        .encode();
        let mut bad_crc = frame.clone();
        bad_crc[1] ^= 0x10;
        assert_eq!(FullStatsFrame::decode(&bad_crc), Err(FrameError::BadCrc));
        assert_eq!(FullStatsFrame::decode(&[0x20, 0x11]), Err(FrameError::BadHeader(0x20)));
        assert_eq!(FullStatsFrame::decode(&[]), Err(FrameError::Empty));
    }

    #[test]
    fn rx_dispatch_by_header() {
        let stats = FullStatsFrame {
            id: Some(0x8181),
            valve: Some(ValveReport {
                percent_open: 80,
                calling_for_heat: true,
            }),
            ..FullStatsFrame::default()
        };
        let prefixed = with_carrier_prefix(stats.encode(), true);
        assert_eq!(decode_rx(&prefixed), Ok(RxFrame::FullStats(stats)));

        let json = frame_json("{\"@\":\"8181\",\"T|C16\":320}").unwrap();
        match decode_rx(&json) {
            Ok(RxFrame::Json(value)) => assert_eq!(value["T|C16"], 320),
            other => panic!("unexpected {other:?}"),
        }

        let fht = Fht8vMessage::set_valve(1, 2, 40);
        assert_eq!(decode_rx(&fht.encode()), Ok(RxFrame::Fht8v(fht)));

        assert!(matches!(decode_rx(&[SECURE_STATS_TYPE, 1, 2]), Ok(RxFrame::Secure(_))));
        assert_eq!(decode_rx(&[0x01, 0x02]), Err(FrameError::BadHeader(0x01)));
        assert_eq!(decode_rx(&[]), Err(FrameError::Empty));
    }
}
