use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("board drives neither a valve nor a boiler")]
    NoRole,
    #[error("an FHT8V valve needs the FS20 radio carrier")]
    Fht8vWithoutFs20Carrier,
    #[error("board cannot drive both a local motor valve and an FHT8V valve")]
    TwoValveActuators,
    #[error("secure stats frames are required but no frame encoder was supplied")]
    SecureFramesWithoutEncoder,
    #[error("invalid tuning: {0}")]
    InvalidTuning(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,
    #[error("frame too short")]
    Truncated,
    #[error("frame would exceed {0} bytes")]
    TooLong(usize),
    #[error("bad frame header 0x{0:02x}")]
    BadHeader(u8),
    #[error("CRC mismatch")]
    BadCrc,
    #[error("parity error")]
    BadParity,
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("malformed bit-stream symbol")]
    BadEncoding,
    #[error("JSON body not transmittable")]
    BadJson,
    #[error("no secret key stored")]
    MissingKey,
    #[error("secure envelope encoding failed")]
    Encrypt,
    #[error("stats transmission not permitted at this privacy level")]
    NotPermitted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CliError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(char),
    #[error("bad arguments")]
    BadArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("radio failed to initialise")]
    RadioInit,
}
