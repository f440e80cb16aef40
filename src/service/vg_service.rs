use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing as log;

use super::{
    DeviceClassManager, free_bytes, full_free_bytes, in_class,
    notifier::{CapacityNotifier, Subscription},
    thin_pool, to_logical_volume, vg_info, vg_volumes,
};
use crate::{
    error::{LvmdError, Result},
    tooling::LvmPort,
    utils::time::now_rfc3339,
    volume::{LogicalVolume, ProvisioningType, VolumeGroupSnapshot},
};

/// Read side of the engine. Takes no volume-group lock: results are
/// advisory and may be stale by the time the caller sees them.
#[derive(Clone)]
pub struct VgService {
    dcm: Arc<DeviceClassManager>,
    lvm: Arc<dyn LvmPort>,
    notifier: CapacityNotifier,
}

impl VgService {
    pub fn new(
        dcm: Arc<DeviceClassManager>,
        lvm: Arc<dyn LvmPort>,
        notifier: CapacityNotifier,
    ) -> Self {
        Self { dcm, lvm, notifier }
    }

    pub fn list_logical_volumes(&self, device_class: &str) -> Result<Vec<LogicalVolume>> {
        let dc = self.dcm.resolve(device_class)?;
        let lvs = vg_volumes(self.lvm.as_ref(), dc)?;
        Ok(lvs
            .into_iter()
            .filter(|lv| in_class(lv, dc))
            .map(to_logical_volume)
            .collect())
    }

    pub fn free_bytes(&self, device_class: &str) -> Result<u64> {
        let dc = self.dcm.resolve(device_class)?;
        free_bytes(self.lvm.as_ref(), dc)
    }

    /// Capacity view of a device class at this instant.
    pub fn snapshot(&self, device_class: &str) -> Result<VolumeGroupSnapshot> {
        let dc = self.dcm.resolve(device_class)?;
        let (total_bytes, free_bytes) = match dc.provisioning {
            ProvisioningType::Full => {
                let vg = vg_info(self.lvm.as_ref(), &dc.volume_group)?;
                (vg.size_bytes, full_free_bytes(&vg, dc))
            }
            ProvisioningType::Thin => {
                let pool = thin_pool(self.lvm.as_ref(), dc)?;
                (pool.effective_capacity(), pool.free_bytes())
            }
        };
        Ok(VolumeGroupSnapshot {
            name: dc.volume_group.clone(),
            device_class: dc.name.clone(),
            total_bytes,
            free_bytes,
            observed_at: now_rfc3339(),
        })
    }

    /// Opens a capacity stream for a device class. The first call to
    /// [`Watch::next`] yields immediately; later calls wait for a notifier
    /// signal on the class's volume group or for `cancel`.
    pub fn watch(&self, device_class: &str, cancel: CancellationToken) -> Result<Watch> {
        let dc = self.dcm.resolve(device_class)?;
        let sub = self.notifier.subscribe(&dc.volume_group);
        log::info!(device_class = %dc.name, vg = %dc.volume_group, "watch opened");
        Ok(Watch {
            svc: self.clone(),
            device_class: dc.name.clone(),
            sub,
            cancel,
            primed: false,
            done: false,
        })
    }
}

/// A live capacity stream. Owns its subscription; dropping the stream
/// deregisters it.
pub struct Watch {
    svc: VgService,
    device_class: String,
    sub: Subscription,
    cancel: CancellationToken,
    primed: bool,
    done: bool,
}

impl Watch {
    /// `None` once the caller cancelled or after an `Err` item.
    pub async fn next(&mut self) -> Option<Result<VolumeGroupSnapshot>> {
        if self.done {
            return None;
        }
        if self.primed {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                woke = self.sub.changed() => woke?,
            }
        }
        self.primed = true;
        if self.cancel.is_cancelled() {
            return None;
        }

        let svc = self.svc.clone();
        let dc = self.device_class.clone();
        let snap = tokio::task::spawn_blocking(move || svc.snapshot(&dc))
            .await
            .map_err(|e| LvmdError::Internal(format!("snapshot task: {e}")))
            .and_then(|r| r);
        self.done = snap.is_err();
        Some(snap)
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        log::info!(device_class = %self.device_class, "watch closed");
    }
}
