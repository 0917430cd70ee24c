use thiserror::Error;

/// Task-side failures of the slave buffers. None of these are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("timed out waiting for bus buffer space or data")]
    Timeout,
    #[error("transmit buffer full")]
    TxFull,
    #[error("receive buffer empty")]
    RxEmpty,
}

/// Problems decoding a host command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HostLinkError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("command {command:#04x} needs {needed} payload bytes, {available} left")]
    MissingData { command: u8, needed: u8, available: u8 },
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),
    #[error("frame of {0} bytes exceeds the inbound limit")]
    FrameTooLarge(usize),
    #[error("host inbox full")]
    InboxFull,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("bus address {0:#04x} is outside the 7-bit range")]
    BadAddress(u8),
    #[error("bus address {0:#04x} is configured more than once")]
    DuplicateAddress(u8),
    #[error("device {address:#04x} payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { address: u8, len: usize, max: usize },
    #[error("{field} must be non-zero")]
    ZeroValue { field: &'static str },
    #[error("{field} of {value} ticks exceeds the {max}-tick wrap limit")]
    TickDistance { field: &'static str, value: u16, max: u16 },
}

/// Failures while wiring up a simulated node set.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fault(#[from] crate::fault::Fault),
}
