// src/orchestrator/heartbeat.rs

//! Transfer slot heartbeat
//!
//! A depot hands out a limited number of transfer slots, each reclaimed
//! after a retention period unless renewed. [`TransferSlotGuard`] holds a
//! slot for its lifetime: it renews the slot from a background thread and
//! releases it on drop, including on error paths.

use crate::backend::Backend;
use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Renewal interval for a slot with `retention` seconds
///
/// Ten seconds before expiry, but at least once a second.
pub fn heartbeat_interval(retention: f64) -> Duration {
    Duration::from_secs_f64((retention - 10.0).max(1.0))
}

/// Stop flag the heartbeat thread sleeps on
type StopSignal = Arc<(Mutex<bool>, Condvar)>;

pub struct TransferSlotGuard {
    backend: Arc<dyn Backend>,
    depot_id: String,
    host_id: String,
    slot_id: String,
    stop: StopSignal,
    heartbeat: Option<JoinHandle<()>>,
}

impl TransferSlotGuard {
    /// Acquire a slot on `depot_id` and start renewing it
    pub fn acquire(backend: Arc<dyn Backend>, depot_id: &str, host_id: &str) -> Result<Self> {
        let slot = backend.acquire_transfer_slot(depot_id, host_id, None)?;
        let Some(retention) = slot.retention else {
            if let Err(e) = backend.release_transfer_slot(depot_id, host_id, &slot.slot_id) {
                warn!("Failed to release transfer slot {}: {}", slot.slot_id, e);
            }
            return Err(Error::BackendError(format!(
                "Transfer slot {} on depot '{}' has no retention time",
                slot.slot_id, depot_id
            )));
        };
        debug!(
            "Acquired transfer slot {} on depot '{}' (retention {}s)",
            slot.slot_id, depot_id, retention
        );

        let stop: StopSignal = Arc::new((Mutex::new(false), Condvar::new()));
        let interval = heartbeat_interval(retention);
        let heartbeat = {
            let backend = Arc::clone(&backend);
            let stop = Arc::clone(&stop);
            let depot_id = depot_id.to_string();
            let host_id = host_id.to_string();
            let slot_id = slot.slot_id.clone();
            thread::spawn(move || renew_until_stopped(backend, &depot_id, &host_id, &slot_id, interval, &stop))
        };

        Ok(Self {
            backend,
            depot_id: depot_id.to_string(),
            host_id: host_id.to_string(),
            slot_id: slot.slot_id,
            stop,
            heartbeat: Some(heartbeat),
        })
    }

    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }
}

fn renew_until_stopped(
    backend: Arc<dyn Backend>,
    depot_id: &str,
    host_id: &str,
    slot_id: &str,
    interval: Duration,
    stop: &StopSignal,
) {
    let (lock, condvar) = &**stop;
    loop {
        let Ok(stopped) = lock.lock() else {
            return;
        };
        let Ok((stopped, _)) = condvar.wait_timeout_while(stopped, interval, |stopped| !*stopped) else {
            return;
        };
        if *stopped {
            return;
        }
        drop(stopped);

        match backend.acquire_transfer_slot(depot_id, host_id, Some(slot_id)) {
            Ok(_) => debug!("Renewed transfer slot {} on depot '{}'", slot_id, depot_id),
            Err(e) => warn!("Failed to renew transfer slot {} on depot '{}': {}", slot_id, depot_id, e),
        }
    }
}

impl Drop for TransferSlotGuard {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.stop;
            if let Ok(mut stopped) = lock.lock() {
                *stopped = true;
            }
            condvar.notify_all();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            if heartbeat.join().is_err() {
                warn!("Heartbeat thread for transfer slot {} panicked", self.slot_id);
            }
        }

        match self
            .backend
            .release_transfer_slot(&self.depot_id, &self.host_id, &self.slot_id)
        {
            Ok(()) => debug!("Released transfer slot {} on depot '{}'", self.slot_id, self.depot_id),
            Err(e) => warn!("Failed to release transfer slot {}: {}", self.slot_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InstalledProduct, ProductInfo, PropertyDefaults, TransferSlot};
    use std::path::Path;

    /// Backend recording slot calls only
    struct SlotBackend {
        retention: Option<f64>,
        calls: Mutex<Vec<String>>,
    }

    impl SlotBackend {
        fn new(retention: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                retention,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl Backend for SlotBackend {
        fn installed_products(&self, _: &str) -> Result<Vec<InstalledProduct>> {
            Ok(Vec::new())
        }
        fn install_package(&self, _: &Path, _: &PropertyDefaults, _: Option<&Path>) -> Result<()> {
            Ok(())
        }
        fn uninstall_package(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn product_property_defaults(&self, _: &str, _: &str) -> Result<PropertyDefaults> {
            Ok(PropertyDefaults::default())
        }
        fn product_info(&self, _: &str, _: &str) -> Result<Option<ProductInfo>> {
            Ok(None)
        }
        fn clients_for_depot(&self, _: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn clients_with_product_installed(&self, _: &str, _: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn set_product_action_request(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn mark_product_cache_outdated(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn power_on_hosts(&self, _: &[String]) -> Result<()> {
            Ok(())
        }
        fn acquire_transfer_slot(&self, _: &str, _: &str, slot_id: Option<&str>) -> Result<TransferSlot> {
            let call = match slot_id {
                Some(id) => format!("renew {id}"),
                None => "acquire".to_string(),
            };
            self.calls.lock().unwrap().push(call);
            Ok(TransferSlot {
                slot_id: "slot-1".into(),
                retention: self.retention,
            })
        }
        fn release_transfer_slot(&self, _: &str, _: &str, slot_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("release {slot_id}"));
            Ok(())
        }
    }

    #[test]
    fn test_heartbeat_interval() {
        assert_eq!(heartbeat_interval(60.0), Duration::from_secs(50));
        assert_eq!(heartbeat_interval(10.5), Duration::from_secs(1));
        assert_eq!(heartbeat_interval(0.0), Duration::from_secs(1));
    }

    #[test]
    fn test_guard_renews_and_releases() {
        let backend = SlotBackend::new(Some(1.0));
        {
            let guard = TransferSlotGuard::acquire(backend.clone(), "depot1", "host1").unwrap();
            assert_eq!(guard.slot_id(), "slot-1");
            thread::sleep(Duration::from_millis(2500));
        }

        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls.first().map(String::as_str), Some("acquire"));
        assert!(calls.iter().filter(|c| c.starts_with("renew")).count() >= 1);
        assert_eq!(calls.last().map(String::as_str), Some("release slot-1"));
    }

    #[test]
    fn test_drop_stops_heartbeat_promptly() {
        let backend = SlotBackend::new(Some(3600.0));
        let guard = TransferSlotGuard::acquire(backend.clone(), "depot1", "host1").unwrap();
        drop(guard);
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["acquire".to_string(), "release slot-1".to_string()]);
    }

    #[test]
    fn test_missing_retention_is_an_error() {
        let backend = SlotBackend::new(None);
        assert!(TransferSlotGuard::acquire(backend.clone(), "depot1", "host1").is_err());
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls.last().map(String::as_str), Some("release slot-1"));
    }
}
