//! Connection lifecycle of a single OBD adapter.
//!
//! Handles connecting to an OBD adapter, discovering its services and
//! tracking the connection state.

use btleplug::api::Peripheral as _;
use btleplug::platform::Peripheral;
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Connection state for an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Connect or service discovery in progress.
    Connecting,
    /// Connected with services discovered.
    Connected,
    /// Disconnect in progress.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        *self == Self::Connected
    }

    /// Check if a connect or disconnect is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }

    /// Name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manages the connection to one adapter.
pub struct ConnectionManager {
    /// Adapter peripheral.
    peripheral: Peripheral,
    /// Identifier used in log messages.
    identifier: String,
    /// Link state.
    state: RwLock<ConnectionState>,
    /// Upper bound for a single connect attempt, service discovery included.
    connect_timeout: Duration,
    /// Number of connect attempts before giving up.
    max_attempts: u32,
    /// Delay between attempts.
    retry_delay: Duration,
}

impl ConnectionManager {
    /// Manage the link to `peripheral`, one attempt by default.
    pub fn new(peripheral: Peripheral, identifier: String, connect_timeout: Duration) -> Self {
        Self {
            peripheral,
            identifier,
            state: RwLock::new(ConnectionState::Disconnected),
            connect_timeout,
            max_attempts: 1,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Set the retry parameters.
    pub fn set_retry_params(&mut self, max_attempts: u32, delay: Duration) {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = delay;
    }

    /// Identifier of the managed peripheral.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Connect to the adapter and discover its services.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionFailed`] when every attempt times out or fails.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => {
                debug!("Already connected to {}", self.identifier);
                return Ok(());
            }
            state if state.is_transitioning() => {
                return Err(Error::ConnectionFailed {
                    reason: format!("{} is {}", self.identifier, state),
                });
            }
            _ => {}
        }

        self.move_to(ConnectionState::Connecting);

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            debug!(
                "Connection attempt {} of {} to {}",
                attempt, self.max_attempts, self.identifier
            );

            match tokio::time::timeout(self.connect_timeout, self.connect_and_discover()).await {
                Ok(Ok(())) => {
                    info!("Connected to {}", self.identifier);
                    self.move_to(ConnectionState::Connected);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        "Connection attempt {} timed out after {:?}",
                        attempt, self.connect_timeout
                    );
                    last_error = format!("timed out after {:?}", self.connect_timeout);
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        // A timed-out attempt may have left a half-open link behind.
        let _ = self.peripheral.disconnect().await;

        self.move_to(ConnectionState::Disconnected);
        Err(Error::ConnectionFailed {
            reason: format!(
                "{} unreachable after {} attempt(s): {}",
                self.identifier, self.max_attempts, last_error
            ),
        })
    }

    async fn connect_and_discover(&self) -> Result<()> {
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.connect().await?;
        }
        self.peripheral.discover_services().await?;
        Ok(())
    }

    /// Disconnect from the adapter.
    pub async fn disconnect(&self) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return Ok(());
        }

        self.move_to(ConnectionState::Disconnecting);

        let result = self.peripheral.disconnect().await;
        self.move_to(ConnectionState::Disconnected);

        match result {
            Ok(()) => {
                info!("Disconnected from {}", self.identifier);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", self.identifier, e);
                Err(Error::Bluetooth(e))
            }
        }
    }

    /// Record that the remote end dropped the link.
    pub fn mark_lost(&self) {
        if self.state() != ConnectionState::Disconnected {
            warn!("Lost connection to {}", self.identifier);
            self.move_to(ConnectionState::Disconnected);
        }
    }

    /// Update the connection state.
    fn move_to(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            debug!("{}: {} -> {}", self.identifier, previous, next);
        }
    }
}
