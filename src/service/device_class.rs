use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use crate::{
    error::{LvmdError, Result},
    volume::{GIB, ProvisioningType},
};

/// Spare capacity applied when a class does not set one.
pub const DEFAULT_SPARE_GIB: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThinPoolConfig {
    pub name: String,
    pub overprovision_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceClass {
    pub name: String,
    pub volume_group: String,
    #[serde(rename = "type")]
    pub provisioning: ProvisioningType,
    #[serde(rename = "spare")]
    pub spare_gib: i64,
    pub default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thin_pool: Option<ThinPoolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_size: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lvcreate_options: Vec<String>,
}

impl DeviceClass {
    #[inline]
    pub fn spare_bytes(&self) -> u64 {
        u64::try_from(self.spare_gib).unwrap_or(0).saturating_mul(GIB)
    }

    #[inline]
    pub fn is_thin(&self) -> bool {
        self.provisioning == ProvisioningType::Thin
    }

    /// Thin pool of a thin class. Validation guarantees presence.
    pub fn pool(&self) -> Result<&ThinPoolConfig> {
        self.thin_pool.as_ref().ok_or_else(|| {
            LvmdError::Config(format!("device class '{}' has no thin_pool", self.name))
        })
    }
}

/// Immutable, process-wide set of device classes.
#[derive(Debug)]
pub struct DeviceClassManager {
    classes: Vec<DeviceClass>,
}

impl DeviceClassManager {
    pub fn new(classes: Vec<DeviceClass>) -> Self {
        Self { classes }
    }

    /// Checks the startup contract. Any failure must stop the daemon.
    pub fn validate(classes: &[DeviceClass]) -> Result<()> {
        if classes.is_empty() {
            return Err(LvmdError::Config("no device class is defined".into()));
        }
        let stripe_size_re = Regex::new(r"^[0-9]+[kKmMgGtTpPeE]?$")
            .map_err(|e| LvmdError::Config(format!("stripe_size pattern: {e}")))?;

        let mut seen = HashSet::new();
        let mut defaults = 0usize;
        for dc in classes {
            if dc.name.is_empty() {
                return Err(LvmdError::Config("device class name is empty".into()));
            }
            if !seen.insert(dc.name.as_str()) {
                return Err(LvmdError::Config(format!(
                    "duplicate device class '{}'",
                    dc.name
                )));
            }
            if dc.volume_group.is_empty() {
                return Err(LvmdError::Config(format!(
                    "device class '{}': volume_group is empty",
                    dc.name
                )));
            }
            if dc.default {
                defaults += 1;
            }
            if dc.spare_gib < 0 {
                return Err(LvmdError::Config(format!(
                    "device class '{}': spare must not be negative ({})",
                    dc.name, dc.spare_gib
                )));
            }
            if let Some(size) = &dc.stripe_size
                && !stripe_size_re.is_match(size)
            {
                return Err(LvmdError::Config(format!(
                    "device class '{}': bad stripe_size '{size}'",
                    dc.name
                )));
            }
            match (dc.provisioning, &dc.thin_pool) {
                (ProvisioningType::Thin, None) => {
                    return Err(LvmdError::Config(format!(
                        "device class '{}': thin_pool is required for type thin",
                        dc.name
                    )));
                }
                (ProvisioningType::Thin, Some(tp)) => {
                    if tp.name.is_empty() {
                        return Err(LvmdError::Config(format!(
                            "device class '{}': thin_pool.name is empty",
                            dc.name
                        )));
                    }
                    if tp.overprovision_ratio.is_nan() || tp.overprovision_ratio <= 0.0 {
                        return Err(LvmdError::Config(format!(
                            "device class '{}': overprovision_ratio must be > 0",
                            dc.name
                        )));
                    }
                }
                (ProvisioningType::Full, Some(_)) => {
                    return Err(LvmdError::Config(format!(
                        "device class '{}': thin_pool is only allowed for type thin",
                        dc.name
                    )));
                }
                (ProvisioningType::Full, None) => {}
            }
        }
        if defaults > 1 {
            return Err(LvmdError::Config(format!(
                "{defaults} device classes are marked default; at most one is allowed"
            )));
        }
        Ok(())
    }

    /// An empty name selects the default class.
    pub fn resolve(&self, name: &str) -> Result<&DeviceClass> {
        let found = if name.is_empty() {
            self.classes.iter().find(|dc| dc.default)
        } else {
            self.classes.iter().find(|dc| dc.name == name)
        };
        found.ok_or_else(|| {
            if name.is_empty() {
                LvmdError::NotFound("default device class".into())
            } else {
                LvmdError::NotFound(format!("device class '{name}'"))
            }
        })
    }

    pub fn classes(&self) -> &[DeviceClass] {
        &self.classes
    }
}
