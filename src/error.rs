//! Error types for the obd-ble-monitor crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Setup failures (`ConnectionFailed`, `ServiceNotFound`,
/// `CharacteristicNotFound`) are surfaced to the caller. Steady-state
/// failures (`WriteFailed`, `Sync`) are logged by the session and never stop
/// it; `NotificationChannel` is the one streaming error that ends a session.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No device with the given identifier has been discovered.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but no device is connected.
    #[error("Device not connected")]
    NotConnected,

    /// A different device is already connected.
    #[error("Already connected to {identifier}")]
    AlreadyConnected {
        /// The identifier of the connected device.
        identifier: String,
    },

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID (or UUID fragment) of the characteristic that was not found.
        uuid: String,
    },

    /// A command could not be written in either write mode.
    #[error("Failed to write command {command:?}: {reason}")]
    WriteFailed {
        /// The logical command, without terminator.
        command: String,
        /// Description of the write failures.
        reason: String,
    },

    /// The notification subscription itself failed.
    #[error("Notification channel error: {reason}")]
    NotificationChannel {
        /// Description of the failure.
        reason: String,
    },

    /// Publishing a telemetry snapshot upstream failed.
    #[error("Upstream sync failed: {message}")]
    Sync {
        /// Description of the failure.
        message: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Sync {
            message: err.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
