//! Volume-group and logical-volume management engine.

pub mod device_class;
pub mod locks;
pub mod lv_service;
pub mod notifier;
pub mod option_class;
pub mod vg_service;

pub use device_class::{DeviceClass, DeviceClassManager};
pub use lv_service::LvService;
pub use notifier::CapacityNotifier;
pub use option_class::{LvcreateOptionClass, LvcreateOptionClassManager};
pub use vg_service::VgService;

use crate::{
    error::{LvmdError, Result},
    tooling::{
        LvmPort,
        lvm::{LvInfo, VgInfo},
    },
    volume::{LogicalVolume, ProvisioningType, ThinPoolSnapshot},
};

fn vg_info(lvm: &dyn LvmPort, vg: &str) -> Result<VgInfo> {
    lvm.list_volume_groups()
        .map_err(LvmdError::internal)?
        .into_iter()
        .find(|v| v.name == vg)
        .ok_or_else(|| LvmdError::NotFound(format!("volume group '{vg}'")))
}

fn thin_pool(lvm: &dyn LvmPort, dc: &DeviceClass) -> Result<ThinPoolSnapshot> {
    let cfg = dc.pool()?;
    let pool = lvm
        .find_pool(&dc.volume_group, &cfg.name)
        .map_err(LvmdError::internal)?
        .ok_or_else(|| {
            LvmdError::NotFound(format!("thin pool '{}/{}'", dc.volume_group, cfg.name))
        })?;
    Ok(ThinPoolSnapshot {
        name: pool.name,
        vg_name: pool.vg_name,
        total_bytes: pool.size_bytes,
        used_bytes: pool.virtual_bytes,
        overprovision_ratio: cfg.overprovision_ratio,
    })
}

/// Allocatable bytes for a Full class: VG free space minus the spare.
#[inline]
fn full_free_bytes(vg: &VgInfo, dc: &DeviceClass) -> u64 {
    vg.free_bytes.saturating_sub(dc.spare_bytes())
}

fn free_bytes(lvm: &dyn LvmPort, dc: &DeviceClass) -> Result<u64> {
    match dc.provisioning {
        ProvisioningType::Full => Ok(full_free_bytes(&vg_info(lvm, &dc.volume_group)?, dc)),
        ProvisioningType::Thin => Ok(thin_pool(lvm, dc)?.free_bytes()),
    }
}

/// Every LV of the class's VG, unfiltered. Fails `NotFound` if the VG is gone.
fn vg_volumes(lvm: &dyn LvmPort, dc: &DeviceClass) -> Result<Vec<LvInfo>> {
    vg_info(lvm, &dc.volume_group)?;
    lvm.list_lvs(&dc.volume_group).map_err(LvmdError::internal)
}

/// Whether `lv` belongs to the class: thin volumes of its pool for a Thin
/// class, plain volumes for a Full class. Pools never do.
fn in_class(lv: &LvInfo, dc: &DeviceClass) -> bool {
    if lv.is_thin_pool() {
        return false;
    }
    match &dc.thin_pool {
        Some(tp) => lv.pool_lv.as_deref() == Some(tp.name.as_str()),
        None => lv.pool_lv.is_none(),
    }
}

fn to_logical_volume(lv: LvInfo) -> LogicalVolume {
    let provisioning = if lv.pool_lv.is_some() {
        ProvisioningType::Thin
    } else {
        ProvisioningType::Full
    };
    LogicalVolume {
        path: format!("/dev/{}/{}", lv.vg_name, lv.lv_name),
        name: lv.lv_name,
        vg_name: lv.vg_name,
        size_bytes: lv.size_bytes,
        provisioning,
        tags: lv.tags,
        pool: lv.pool_lv,
        origin: lv.origin,
    }
}
