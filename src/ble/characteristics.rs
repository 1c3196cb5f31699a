//! Write/notify characteristic resolution and GATT plumbing for one adapter.

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{GattService, NotificationStream, WriteMode};
use crate::ble::uuids::matches_fragment;
use crate::error::{Error, Result};

/// Notification buffer depth. Slow receivers lose the oldest payloads.
const NOTIFICATION_BUFFER: usize = 256;

/// The write and notify characteristics a session talks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicPair {
    /// Service both characteristics belong to.
    pub service: Uuid,
    /// Characteristic commands are written to.
    pub write: Uuid,
    /// Characteristic replies are notified on.
    pub notify: Uuid,
}

/// Resolve the write/notify pair inside `service_uuid`.
///
/// Characteristics are matched by case-insensitive UUID fragment because
/// adapters expose varying exact UUIDs. Both fragments may resolve to the
/// same characteristic.
///
/// # Errors
///
/// [`Error::ServiceNotFound`] if the service is absent and
/// [`Error::CharacteristicNotFound`] if either fragment has no match.
pub fn resolve_characteristics(
    services: &[GattService],
    service_uuid: &Uuid,
    write_fragment: &str,
    notify_fragment: &str,
) -> Result<CharacteristicPair> {
    let service = services
        .iter()
        .find(|s| s.uuid == *service_uuid)
        .ok_or_else(|| Error::ServiceNotFound {
            uuid: service_uuid.to_string(),
        })?;

    let find = |fragment: &str| {
        service
            .characteristics
            .iter()
            .copied()
            .find(|uuid| matches_fragment(uuid, fragment))
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: fragment.to_string(),
            })
    };

    let write = find(write_fragment)?;
    let notify = find(notify_fragment)?;

    debug!(
        "Resolved characteristics in {}: write={}, notify={}",
        service.uuid, write, notify
    );

    Ok(CharacteristicPair {
        service: service.uuid,
        write,
        notify,
    })
}

/// One payload notified by the adapter.
#[derive(Debug, Clone)]
struct Notified {
    source: Uuid,
    value: Vec<u8>,
}

/// GATT access to a connected adapter.
///
/// Services must already be discovered on the peripheral.
pub struct AdapterGatt {
    peripheral: Peripheral,
    /// Known characteristics keyed by (service, characteristic).
    known: RwLock<HashMap<(Uuid, Uuid), Characteristic>>,
    /// Fan-out of notified payloads. Taking it closes every stream.
    fanout: Arc<RwLock<Option<broadcast::Sender<Notified>>>>,
    /// Task forwarding the peripheral notification stream.
    forwarder: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl AdapterGatt {
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            known: RwLock::new(HashMap::new()),
            fanout: Arc::new(RwLock::new(None)),
            forwarder: RwLock::new(None),
        }
    }

    /// Refresh the characteristic table and list it by service.
    pub fn refresh(&self) -> Vec<GattService> {
        let mut known = self.known.write();
        known.clear();

        let services: Vec<GattService> = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| {
                let uuids = service.characteristics.iter().map(|c| c.uuid).collect();
                for c in service.characteristics {
                    trace!("{} / {} {:?}", service.uuid, c.uuid, c.properties);
                    known.insert((service.uuid, c.uuid), c);
                }
                GattService {
                    uuid: service.uuid,
                    characteristics: uuids,
                }
            })
            .collect();

        debug!(
            "{} services, {} characteristics",
            services.len(),
            known.len()
        );
        services
    }

    fn lookup(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic> {
        let known = self.known.read();
        match known.get(&(service, uuid)) {
            Some(c) => Ok(c.clone()),
            None => Err(Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            }),
        }
    }

    /// Write `data` using the given mode.
    pub async fn write(
        &self,
        service: Uuid,
        uuid: Uuid,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let target = self.lookup(service, uuid)?;
        let kind = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral.write(&target, data, kind).await?;
        trace!("{} <- {} bytes ({})", uuid, data.len(), mode);
        Ok(())
    }

    /// Enable notifications on `uuid`.
    pub async fn enable_notify(&self, service: Uuid, uuid: Uuid) -> Result<()> {
        let target = self.lookup(service, uuid)?;
        if let Err(e) = self.peripheral.subscribe(&target).await {
            warn!("Enabling notifications on {} failed: {}", uuid, e);
            return Err(e.into());
        }
        debug!("Notifications enabled on {}", uuid);
        Ok(())
    }

    /// Disable notifications on `uuid`.
    pub async fn disable_notify(&self, service: Uuid, uuid: Uuid) -> Result<()> {
        let target = self.lookup(service, uuid)?;
        self.peripheral.unsubscribe(&target).await?;
        debug!("Notifications disabled on {}", uuid);
        Ok(())
    }

    /// Whether payloads are being forwarded.
    pub fn is_forwarding(&self) -> bool {
        self.fanout.read().is_some()
    }

    /// Start forwarding the peripheral's notifications. Idempotent.
    pub async fn start_forwarding(&self) -> Result<()> {
        if self.is_forwarding() {
            return Ok(());
        }

        let mut incoming =
            self.peripheral
                .notifications()
                .await
                .map_err(|e| Error::NotificationChannel {
                    reason: e.to_string(),
                })?;

        let (tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        *self.fanout.write() = Some(tx);

        let fanout = self.fanout.clone();
        let task = tokio::spawn(async move {
            while let Some(n) = incoming.next().await {
                trace!("{} -> {:02X?}", n.uuid, n.value);
                let forwarded = fanout.read().as_ref().map(|tx| {
                    let _ = tx.send(Notified {
                        source: n.uuid,
                        value: n.value,
                    });
                });
                if forwarded.is_none() {
                    break;
                }
            }
            if fanout.write().take().is_some() {
                warn!("Peripheral notification stream ended");
            }
        });

        *self.forwarder.write() = Some(task);
        Ok(())
    }

    /// Stop forwarding. Open streams yield a channel error and end.
    pub fn stop_forwarding(&self) {
        self.fanout.write().take();
        if let Some(task) = self.forwarder.write().take() {
            task.abort();
        }
    }

    /// Stream the payloads notified on one characteristic.
    ///
    /// Payloads lost to buffer overrun are skipped. When the listener stops
    /// the stream yields one [`Error::NotificationChannel`] and ends.
    pub fn notification_stream(&self, uuid: Uuid) -> Result<NotificationStream> {
        let rx = self
            .fanout
            .read()
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| Error::NotificationChannel {
                reason: "not forwarding notifications".to_string(),
            })?;

        let stream = stream::unfold(Some(rx), move |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(n) if n.source == uuid => return Some((Ok(n.value), Some(rx))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} notifications from {}", skipped, uuid);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Notifications from {} stopped", uuid);
                        let err = Error::NotificationChannel {
                            reason: "notification stream closed".to_string(),
                        };
                        return Some((Err(err), None));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

impl Drop for AdapterGatt {
    fn drop(&mut self) {
        self.stop_forwarding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;

    fn uuid16(short: u16) -> Uuid {
        Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
    }

    fn adapter_services() -> Vec<GattService> {
        vec![
            GattService {
                uuid: uuid16(0x180a),
                characteristics: vec![uuid16(0x2a29), uuid16(0x2a24)],
            },
            GattService {
                uuid: OBD_SERVICE_UUID,
                characteristics: vec![uuid16(0xfff1), uuid16(0xfff2)],
            },
        ]
    }

    #[test]
    fn test_uuid16_helper() {
        assert_eq!(uuid16(0xfff0), OBD_SERVICE_UUID);
    }

    #[test]
    fn test_resolve_characteristics() {
        let pair = resolve_characteristics(
            &adapter_services(),
            &OBD_SERVICE_UUID,
            WRITE_CHARACTERISTIC_FRAGMENT,
            NOTIFY_CHARACTERISTIC_FRAGMENT,
        )
        .unwrap();

        assert_eq!(pair.service, OBD_SERVICE_UUID);
        assert_eq!(pair.write, uuid16(0xfff2));
        assert_eq!(pair.notify, uuid16(0xfff1));
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let pair =
            resolve_characteristics(&adapter_services(), &OBD_SERVICE_UUID, "FFF2", "FfF1").unwrap();
        assert_eq!(pair.write, uuid16(0xfff2));
        assert_eq!(pair.notify, uuid16(0xfff1));
    }

    #[test]
    fn test_resolve_same_characteristic_for_both() {
        let services = vec![GattService {
            uuid: OBD_SERVICE_UUID,
            characteristics: vec![uuid16(0xffe1)],
        }];
        let pair = resolve_characteristics(&services, &OBD_SERVICE_UUID, "ffe1", "ffe1").unwrap();
        assert_eq!(pair.write, pair.notify);
    }

    #[test]
    fn test_resolve_missing_service() {
        let services = vec![adapter_services().remove(0)];
        let err = resolve_characteristics(&services, &OBD_SERVICE_UUID, "fff2", "fff1")
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound { .. }));
    }

    #[test]
    fn test_resolve_missing_characteristic() {
        let err = resolve_characteristics(&adapter_services(), &OBD_SERVICE_UUID, "fff2", "ffe1")
            .unwrap_err();
        match err {
            Error::CharacteristicNotFound { uuid } => assert_eq!(uuid, "ffe1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_fragment_outside_service_is_ignored() {
        // 2a29 exists, but only in the device information service.
        let err = resolve_characteristics(&adapter_services(), &OBD_SERVICE_UUID, "2a29", "fff1")
            .unwrap_err();
        assert!(matches!(err, Error::CharacteristicNotFound { .. }));
    }
}
