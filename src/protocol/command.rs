//! Command framing and the write side of the adapter link.
//!
//! GATT gives no framing or request correlation: a command is ASCII text
//! terminated by a carriage return, and its reply arrives later on the
//! notify characteristic.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::ble::characteristics::CharacteristicPair;
use crate::ble::transport::{DeviceHandle, Transport, WriteMode};
use crate::error::{Error, Result};

/// Terminator appended to every command.
pub const COMMAND_TERMINATOR: &str = "\r";

/// Turn command echo off.
pub const DISABLE_ECHO: &str = "ATE0";

/// Let the adapter pick the vehicle protocol.
pub const AUTO_PROTOCOL: &str = "ATSP0";

/// Commands sent once when a session starts, in order.
pub const INIT_SEQUENCE: [&str; 2] = [DISABLE_ECHO, AUTO_PROTOCOL];

/// Default delay after each init command.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Frame a logical command for the wire.
pub fn frame_command(command: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + COMMAND_TERMINATOR.len());
    frame.extend_from_slice(command.as_bytes());
    frame.extend_from_slice(COMMAND_TERMINATOR.as_bytes());
    frame
}

/// Check whether `command` is a Mode 01 PID request such as `010C`.
pub fn is_pid_command(command: &str) -> bool {
    command.len() == 4
        && command.starts_with("01")
        && command.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Write channel to the adapter's command characteristic.
#[derive(Clone)]
pub struct CommandChannel {
    transport: Arc<dyn Transport>,
    device: DeviceHandle,
    characteristics: CharacteristicPair,
}

impl CommandChannel {
    /// Create a channel for a connected device.
    pub fn new(
        transport: Arc<dyn Transport>,
        device: DeviceHandle,
        characteristics: CharacteristicPair,
    ) -> Self {
        Self {
            transport,
            device,
            characteristics,
        }
    }

    /// The device this channel writes to.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// The characteristics this channel uses.
    pub fn characteristics(&self) -> &CharacteristicPair {
        &self.characteristics
    }

    /// Send one command.
    ///
    /// Tries an acknowledged write first and falls back to a write without
    /// response.
    ///
    /// # Errors
    ///
    /// [`Error::WriteFailed`] when both write modes fail.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let frame = frame_command(command);
        trace!("Writing {:02X?}", frame);

        let acked = self.write(&frame, WriteMode::WithResponse).await;
        let Err(acked_error) = acked else {
            debug!("Sent {}", command);
            return Ok(());
        };

        debug!(
            "Write {} failed for {}: {}, retrying {}",
            WriteMode::WithResponse,
            command,
            acked_error,
            WriteMode::WithoutResponse
        );

        match self.write(&frame, WriteMode::WithoutResponse).await {
            Ok(()) => {
                debug!("Sent {} {}", command, WriteMode::WithoutResponse);
                Ok(())
            }
            Err(unacked_error) => Err(Error::WriteFailed {
                command: command.to_string(),
                reason: format!(
                    "{}: {}; {}: {}",
                    WriteMode::WithResponse,
                    acked_error,
                    WriteMode::WithoutResponse,
                    unacked_error
                ),
            }),
        }
    }

    /// Run the init sequence, waiting `settle` after each command.
    ///
    /// Failures are logged and never abort the sequence.
    pub async fn initialize(&self, settle: Duration) {
        info!("Initializing adapter {}", self.device.display_name());

        for command in INIT_SEQUENCE {
            if let Err(e) = self.send_command(command).await {
                warn!("Init command {} failed: {}", command, e);
            }
            tokio::time::sleep(settle).await;
        }
    }

    async fn write(&self, frame: &[u8], mode: WriteMode) -> Result<()> {
        self.transport
            .write(
                &self.device,
                self.characteristics.service,
                self.characteristics.write,
                frame,
                mode,
            )
            .await
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("device", &self.device)
            .field("characteristics", &self.characteristics)
            .finish_non_exhaustive()
    }
}
