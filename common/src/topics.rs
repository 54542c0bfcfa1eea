pub const TOPIC_RADIO_FRAMES: &str = "opentrv/radio/frames";
pub const TOPIC_STATUS: &str = "opentrv/status";
