use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use config as cfg;
use serde::{Deserialize, Serialize};

use crate::{
    service::{
        DeviceClass, DeviceClassManager, LvcreateOptionClass, LvcreateOptionClassManager,
        device_class::{DEFAULT_SPARE_GIB, ThinPoolConfig},
    },
    volume::ProvisioningType,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lvmd/lvmd.yaml";
pub const DEFAULT_SOCKET_NAME: &str = "/run/lvmd/lvmd.sock";

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_name: PathBuf,
    pub device_classes: Vec<DeviceClass>,
    pub lvcreate_option_classes: Vec<LvcreateOptionClass>,
}

impl Config {
    /// Loads, normalizes and validates a YAML or TOML file. The format is
    /// taken from the extension.
    pub fn load(path: &Path) -> Result<Self> {
        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        let socket_name = trim_opt(raw.socket_name)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_NAME));
        if !socket_name.is_absolute() {
            bail!("socket_name must be absolute: {}", socket_name.display());
        }

        let device_classes = raw
            .device_classes
            .into_iter()
            .enumerate()
            .map(|(i, dc)| dc.normalize(i))
            .collect::<Result<Vec<_>>>()?;
        DeviceClassManager::validate(&device_classes)?;

        let lvcreate_option_classes = raw
            .lvcreate_option_classes
            .into_iter()
            .map(|oc| LvcreateOptionClass {
                name: oc.name.trim().to_string(),
                options: oc.options,
            })
            .collect::<Vec<_>>();
        LvcreateOptionClassManager::validate(&lvcreate_option_classes)?;

        Ok(Self {
            socket_name,
            device_classes,
            lvcreate_option_classes,
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Out<'a> {
            socket_name: String,
            device_classes: &'a [DeviceClass],
            #[serde(skip_serializing_if = "is_empty_slice")]
            lvcreate_option_classes: &'a [LvcreateOptionClass],
        }

        let out = Out {
            socket_name: self.socket_name.display().to_string(),
            device_classes: &self.device_classes,
            lvcreate_option_classes: &self.lvcreate_option_classes,
        };
        Ok(toml::to_string_pretty(&out)?)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    socket_name: Option<String>,
    #[serde(default)]
    device_classes: Vec<RawDeviceClass>,
    #[serde(default)]
    lvcreate_option_classes: Vec<RawOptionClass>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceClass {
    name: String,
    volume_group: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    spare: Option<i64>,
    #[serde(default)]
    default: bool,
    stripe: Option<u32>,
    stripe_size: Option<String>,
    #[serde(default)]
    lvcreate_options: Vec<String>,
    thin_pool: Option<RawThinPool>,
}

#[derive(Debug, Deserialize)]
struct RawThinPool {
    name: Option<String>,
    overprovision_ratio: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawOptionClass {
    name: String,
    #[serde(default)]
    options: Vec<String>,
}

impl RawDeviceClass {
    fn normalize(self, idx: usize) -> Result<DeviceClass> {
        let name = self.name.trim().to_string();
        let at = || format!("device_classes[{idx}] ('{name}')");

        let provisioning = match trim_opt(self.kind).as_deref() {
            None | Some("thick") | Some("full") => ProvisioningType::Full,
            Some("thin") => ProvisioningType::Thin,
            Some(other) => bail!("{}: unknown type '{other}', use thick or thin", at()),
        };
        let thin_pool = match self.thin_pool {
            Some(tp) => Some(ThinPoolConfig {
                name: trim_opt(tp.name).unwrap_or_default(),
                overprovision_ratio: tp
                    .overprovision_ratio
                    .ok_or_else(|| anyhow!("{}: thin_pool.overprovision_ratio is required", at()))?,
            }),
            None => None,
        };

        Ok(DeviceClass {
            volume_group: self.volume_group.trim().to_string(),
            provisioning,
            spare_gib: self.spare.unwrap_or(DEFAULT_SPARE_GIB),
            default: self.default,
            thin_pool,
            stripe: self.stripe,
            stripe_size: trim_opt(self.stripe_size),
            lvcreate_options: self.lvcreate_options,
            name,
        })
    }
}

fn is_empty_slice<T>(s: &&[T]) -> bool {
    s.is_empty()
}

#[inline]
fn trim_opt(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
