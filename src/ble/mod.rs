//! BLE communication module.
//!
//! This module provides the transport seam used by the session and its
//! btleplug implementation for discovering and talking to OBD adapters.

pub mod btleplug_transport;
pub mod characteristics;
pub mod connection;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use btleplug_transport::BtleplugTransport;
pub use characteristics::{resolve_characteristics, AdapterGatt, CharacteristicPair};
pub use connection::{ConnectionManager, ConnectionState};
pub use scanner::BleScanner;
pub use transport::{
    DeviceHandle, DeviceStream, DiscoveredDevice, GattService, NotificationStream, Transport,
    WriteMode,
};
pub use uuids::*;
