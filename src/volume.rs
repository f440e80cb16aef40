use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

pub const GIB: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningType {
    Full,
    Thin,
}

impl fmt::Display for ProvisioningType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningType::Full => f.write_str("full"),
            ProvisioningType::Thin => f.write_str("thin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolume {
    pub name: String,
    pub vg_name: String,
    pub size_bytes: u64,
    pub provisioning: ProvisioningType,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Device node, e.g. "/dev/vg-ssd/pvc-1234"
    pub path: String,
    /// Thin pool the volume lives in (thin volumes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    /// Source volume for snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl LogicalVolume {
    #[cfg(test)]
    pub fn is_thin(&self) -> bool {
        self.provisioning == ProvisioningType::Thin
    }
}

/// Capacity view of one device class, computed for a single request or
/// delivery and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupSnapshot {
    /// Volume group name.
    pub name: String,
    pub device_class: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// RFC 3339, UTC.
    pub observed_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThinPoolSnapshot {
    pub name: String,
    pub vg_name: String,
    pub total_bytes: u64,
    /// Sum of the virtual sizes of the thin volumes in the pool.
    pub used_bytes: u64,
    pub overprovision_ratio: f64,
}

impl ThinPoolSnapshot {
    /// Advertised capacity: physical pool size times the overprovision ratio.
    #[inline]
    pub fn effective_capacity(&self) -> u64 {
        (self.total_bytes as f64 * self.overprovision_ratio).floor() as u64
    }

    #[inline]
    pub fn free_bytes(&self) -> u64 {
        self.effective_capacity().saturating_sub(self.used_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl AccessType {
    /// Value for `lvcreate --permission`.
    #[inline]
    pub fn permission(self) -> &'static str {
        match self {
            AccessType::ReadOnly => "r",
            AccessType::ReadWrite => "rw",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(total_gib: u64, used_gib: u64, ratio: f64) -> ThinPoolSnapshot {
        ThinPoolSnapshot {
            name: "pool0".into(),
            vg_name: "vg".into(),
            total_bytes: total_gib * GIB,
            used_bytes: used_gib * GIB,
            overprovision_ratio: ratio,
        }
    }

    #[test]
    fn thin_free_uses_overprovision_ratio() {
        let p = pool(100, 150, 2.0);
        assert_eq!(p.effective_capacity(), 200 * GIB);
        assert_eq!(p.free_bytes(), 50 * GIB);
    }

    #[test]
    fn thin_free_never_negative() {
        assert_eq!(pool(100, 250, 2.0).free_bytes(), 0);
    }

    #[test]
    fn access_type_wire_names() {
        assert_eq!(serde_json::to_string(&AccessType::ReadOnly).unwrap(), r#""ro""#);
        let rw: AccessType = serde_json::from_str(r#""rw""#).unwrap();
        assert_eq!(rw.permission(), "rw");
    }
}
