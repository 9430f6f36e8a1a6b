//! MODBUS exception codes and daemon-level fatal errors.

use thiserror::Error;

/// MODBUS exception codes the daemon is allowed to inject into a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    GatewayPathUnavailable,
    GatewayTargetDeviceFailed,
}

impl ModbusException {
    pub fn code(self) -> u8 {
        match self {
            ModbusException::IllegalFunction => 0x01,
            ModbusException::IllegalDataAddress => 0x02,
            ModbusException::IllegalDataValue => 0x03,
            ModbusException::SlaveDeviceFailure => 0x04,
            ModbusException::GatewayPathUnavailable => 0x0a,
            ModbusException::GatewayTargetDeviceFailed => 0x0b,
        }
    }
}

/// Fatal errors that can occur during daemon startup or teardown.
///
/// Per-request failures never use this type; they are surfaced as
/// [`ModbusException`] replies instead.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot bind TCP listener on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot create poll instance: {0}")]
    Poll(#[source] std::io::Error),

    #[error("libusb error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("persistent settings error: {0}")]
    Persist(#[source] std::io::Error),
}
