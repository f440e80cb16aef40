use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing as log;

use super::{
    DeviceClass, DeviceClassManager, LvcreateOptionClassManager, full_free_bytes, in_class,
    locks::VgLocks, notifier::CapacityNotifier, thin_pool, to_logical_volume, vg_info,
    vg_volumes,
};
use crate::{
    error::{LvmdError, Result},
    tooling::{
        LvmPort,
        lvm::{LvCreate, LvInfo, SnapshotCreate},
    },
    volume::{AccessType, LogicalVolume, ProvisioningType},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLvRequest {
    #[serde(default)]
    pub device_class: String,
    pub name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lvcreate_option_class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeLvRequest {
    #[serde(default)]
    pub device_class: String,
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLvRequest {
    #[serde(default)]
    pub device_class: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    #[serde(default)]
    pub device_class: String,
    pub source: String,
    pub name: String,
    pub access_type: AccessType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Mutating side of the engine.
///
/// Every operation runs its capacity check and the executor call inside the
/// target volume group's lock, and signals the notifier only after the
/// executor succeeded.
#[derive(Clone)]
pub struct LvService {
    dcm: Arc<DeviceClassManager>,
    ocm: Arc<LvcreateOptionClassManager>,
    lvm: Arc<dyn LvmPort>,
    notifier: CapacityNotifier,
    locks: Arc<VgLocks>,
}

impl LvService {
    pub fn new(
        dcm: Arc<DeviceClassManager>,
        ocm: Arc<LvcreateOptionClassManager>,
        lvm: Arc<dyn LvmPort>,
        notifier: CapacityNotifier,
    ) -> Self {
        Self {
            dcm,
            ocm,
            lvm,
            notifier,
            locks: Arc::new(VgLocks::new()),
        }
    }

    pub fn create_lv(&self, req: &CreateLvRequest) -> Result<LogicalVolume> {
        let dc = self.dcm.resolve(&req.device_class)?;
        let oc = self.ocm.resolve(req.lvcreate_option_class.as_deref())?;
        validate_lv_name(&req.name)?;
        if req.size_bytes == 0 {
            return Err(LvmdError::InvalidArgument("size_bytes must be > 0".into()));
        }

        let mut extra_options = dc.lvcreate_options.clone();
        if let Some(oc) = oc {
            extra_options.extend(oc.options.iter().cloned());
        }
        let spec = LvCreate {
            vg: dc.volume_group.clone(),
            name: req.name.clone(),
            size_bytes: req.size_bytes,
            thin_pool: dc.thin_pool.as_ref().map(|tp| tp.name.clone()),
            stripe: dc.stripe,
            stripe_size: dc.stripe_size.clone(),
            tags: req.tags.clone(),
            extra_options,
        };

        let lv = self.locks.with(&dc.volume_group, || {
            let lvs = vg_volumes(self.lvm.as_ref(), dc)?;
            if lvs.iter().any(|lv| lv.lv_name == req.name) {
                return Err(LvmdError::AlreadyExists(format!(
                    "logical volume '{}/{}'",
                    dc.volume_group, req.name
                )));
            }
            self.ensure_capacity(dc, req.size_bytes)?;

            self.lvm.create_lv(&spec).map_err(LvmdError::internal)?;
            self.notifier.signal(&dc.volume_group);
            self.read_back(dc, &req.name)
        })?;

        log::info!(
            vg = %lv.vg_name,
            lv = %lv.name,
            size = lv.size_bytes,
            provisioning = %lv.provisioning,
            "created logical volume"
        );
        Ok(lv)
    }

    /// Grows a volume. Shrinking is never allowed.
    pub fn resize_lv(&self, req: &ResizeLvRequest) -> Result<LogicalVolume> {
        let dc = self.dcm.resolve(&req.device_class)?;

        let lv = self.locks.with(&dc.volume_group, || {
            let current = self.find_in_class(dc, &req.name)?;
            if req.size_bytes <= current.size_bytes {
                return Err(LvmdError::InvalidArgument(format!(
                    "new size {} must be larger than current size {} of '{}'",
                    req.size_bytes, current.size_bytes, req.name
                )));
            }
            self.ensure_capacity(dc, req.size_bytes - current.size_bytes)?;

            self.lvm
                .resize_lv(&dc.volume_group, &req.name, req.size_bytes)
                .map_err(LvmdError::internal)?;
            self.notifier.signal(&dc.volume_group);
            self.read_back(dc, &req.name)
        })?;

        log::info!(vg = %lv.vg_name, lv = %lv.name, size = lv.size_bytes, "resized logical volume");
        Ok(lv)
    }

    /// Not idempotent: removing a missing volume reports `NotFound`.
    pub fn remove_lv(&self, req: &RemoveLvRequest) -> Result<()> {
        let dc = self.dcm.resolve(&req.device_class)?;

        self.locks.with(&dc.volume_group, || {
            self.find_in_class(dc, &req.name)?;
            self.lvm
                .remove_lv(&dc.volume_group, &req.name)
                .map_err(LvmdError::internal)?;
            self.notifier.signal(&dc.volume_group);
            Ok(())
        })?;

        log::info!(vg = %dc.volume_group, lv = %req.name, "removed logical volume");
        Ok(())
    }

    /// Thin snapshot of a thin volume, allocated from the source's pool.
    pub fn create_snapshot(&self, req: &CreateSnapshotRequest) -> Result<LogicalVolume> {
        let dc = self.dcm.resolve(&req.device_class)?;
        if !dc.is_thin() {
            return Err(LvmdError::InvalidArgument(format!(
                "device class '{}' is not thin; snapshots need thin provisioning",
                dc.name
            )));
        }
        validate_lv_name(&req.name)?;
        let pool = dc.pool()?;

        let lv = self.locks.with(&dc.volume_group, || {
            let lvs = vg_volumes(self.lvm.as_ref(), dc)?;
            let source = lvs
                .iter()
                .find(|lv| lv.lv_name == req.source && !lv.is_thin_pool())
                .ok_or_else(|| {
                    LvmdError::NotFound(format!(
                        "logical volume '{}/{}'",
                        dc.volume_group, req.source
                    ))
                })?;
            match source.pool_lv.as_deref() {
                None => {
                    return Err(LvmdError::InvalidArgument(format!(
                        "source '{}' is fully provisioned; only thin volumes can be snapshotted",
                        req.source
                    )));
                }
                Some(p) if p != pool.name => {
                    return Err(LvmdError::InvalidArgument(format!(
                        "source '{}' lives in pool '{p}', not in '{}'",
                        req.source, pool.name
                    )));
                }
                Some(_) => {}
            }
            if lvs.iter().any(|lv| lv.lv_name == req.name) {
                return Err(LvmdError::AlreadyExists(format!(
                    "logical volume '{}/{}'",
                    dc.volume_group, req.name
                )));
            }
            self.ensure_capacity(dc, source.size_bytes)?;

            self.lvm
                .create_snapshot(&SnapshotCreate {
                    vg: dc.volume_group.clone(),
                    source: req.source.clone(),
                    name: req.name.clone(),
                    access: req.access_type,
                    tags: req.tags.clone(),
                })
                .map_err(LvmdError::internal)?;
            self.notifier.signal(&dc.volume_group);
            self.read_back(dc, &req.name)
        })?;

        log::info!(
            vg = %lv.vg_name,
            lv = %lv.name,
            source = %req.source,
            access = req.access_type.permission(),
            "created snapshot"
        );
        Ok(lv)
    }

    /// Fails `ResourceExhausted` if `need` more bytes do not fit the class.
    /// Must run under the volume group's lock.
    fn ensure_capacity(&self, dc: &DeviceClass, need: u64) -> Result<()> {
        let free = match dc.provisioning {
            ProvisioningType::Full => {
                full_free_bytes(&vg_info(self.lvm.as_ref(), &dc.volume_group)?, dc)
            }
            ProvisioningType::Thin => thin_pool(self.lvm.as_ref(), dc)?.free_bytes(),
        };
        if need > free {
            return Err(LvmdError::ResourceExhausted(format!(
                "device class '{}' has {free} bytes free, {need} requested",
                dc.name
            )));
        }
        Ok(())
    }

    fn find_in_class(&self, dc: &DeviceClass, name: &str) -> Result<LvInfo> {
        vg_volumes(self.lvm.as_ref(), dc)?
            .into_iter()
            .find(|lv| lv.lv_name == name && in_class(lv, dc))
            .ok_or_else(|| {
                LvmdError::NotFound(format!("logical volume '{}/{name}'", dc.volume_group))
            })
    }

    fn read_back(&self, dc: &DeviceClass, name: &str) -> Result<LogicalVolume> {
        self.lvm
            .list_lvs(&dc.volume_group)
            .map_err(LvmdError::internal)?
            .into_iter()
            .find(|lv| lv.lv_name == name)
            .map(to_logical_volume)
            .ok_or_else(|| {
                LvmdError::Internal(format!(
                    "'{}/{name}' missing right after a successful command",
                    dc.volume_group
                ))
            })
    }
}

/// LVM name rules, minus the reserved prefixes we never produce.
fn validate_lv_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LvmdError::InvalidArgument("volume name is empty".into()));
    }
    let ok = name.len() <= 127
        && !name.starts_with('-')
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'_' | b'.' | b'-'));
    if !ok {
        return Err(LvmdError::InvalidArgument(format!(
            "bad volume name '{name}': use [A-Za-z0-9+_.-], not starting with '-'"
        )));
    }
    Ok(())
}
