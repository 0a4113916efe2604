//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Batched per-device reads handed to the conversion worker."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use r_ems_common::time::unix_millis;
use tracing::trace;

use crate::device::Device;
use crate::error::SessionError;
use crate::guard::SessionGuard;
use crate::value::RawReading;

/// Readings of one device for one cycle. Moved into the channel as a whole
/// and never touched by the poll loop again.
#[derive(Debug, Clone)]
pub struct AcquisitionUnit {
    pub device: Arc<Device>,
    pub readings: Vec<RawReading>,
    /// Unix milliseconds at which the reply arrived.
    pub acquired_at: i64,
}

/// Issue one batched read across every tag of `device`.
pub async fn acquire(
    guard: &SessionGuard,
    device: &Arc<Device>,
) -> Result<AcquisitionUnit, SessionError> {
    let readings = if device.has_tags() {
        guard.read(device.tag_paths()).await?
    } else {
        Vec::new()
    };
    trace!(device = %device.name(), readings = readings.len(), "device acquired");
    Ok(AcquisitionUnit {
        device: device.clone(),
        readings,
        acquired_at: unix_millis(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use r_ems_common::config::{DeviceConfig, TagConfig};

    use super::*;
    use crate::converter::ConverterRegistry;
    use crate::session::{MemorySession, MemoryStore};
    use crate::value::TagValue;

    fn setup(store: &MemoryStore) -> (SessionGuard, Arc<Device>) {
        let mut config = DeviceConfig::new("dev", "default");
        config.timeseries.push(TagConfig::new("a", "A"));
        config.timeseries.push(TagConfig::new("b", "B"));
        config.timeseries.push(TagConfig::new("c", "C"));
        let device =
            Arc::new(Device::from_config(&config, None, &ConverterRegistry::default()).unwrap());
        let guard = SessionGuard::new(
            Box::new(MemorySession::with_store(store.clone())),
            Duration::from_millis(50),
        );
        (guard, device)
    }

    #[tokio::test]
    async fn one_read_per_device() {
        let store = MemoryStore::default();
        store.set("A", 1_i64);
        store.set("B", 2_i64);
        store.set("C", 3_i64);
        let (guard, device) = setup(&store);
        guard.connect("srv", "host").await.unwrap();

        let unit = acquire(&guard, &device).await.unwrap();
        assert_eq!(store.calls().read, 1);
        let paths: Vec<_> = unit.readings.iter().map(|r| r.tag_path.as_str()).collect();
        assert_eq!(paths, vec!["A", "B", "C"]);
        assert_eq!(unit.readings[2].value, TagValue::Int(3));
    }

    #[tokio::test]
    async fn read_errors_propagate() {
        let store = MemoryStore::default();
        let (guard, device) = setup(&store);
        let err = acquire(&guard, &device).await.unwrap_err();
        assert_eq!(err, SessionError::NotConnected);
    }

    #[tokio::test]
    async fn devices_without_tags_skip_the_session() {
        let store = MemoryStore::default();
        let (guard, _) = setup(&store);
        let empty = Arc::new(
            Device::from_config(
                &DeviceConfig::new("empty", "default"),
                None,
                &ConverterRegistry::default(),
            )
            .unwrap(),
        );
        let unit = acquire(&guard, &empty).await.unwrap();
        assert!(unit.readings.is_empty());
        assert_eq!(store.calls().read, 0);
    }
}
