use std::{collections::BTreeSet, sync::Arc};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::{
    utils::process::{CmdSpec, Runner},
    volume::AccessType,
};

pub const DEFAULT_LVM_PATH: &str = "/sbin/lvm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VgInfo {
    pub name: String,
    pub size_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvInfo {
    pub lv_name: String,
    pub vg_name: String,
    pub size_bytes: u64,
    pub segtype: String,
    pub pool_lv: Option<String>,
    pub origin: Option<String>,
    pub tags: BTreeSet<String>,
}

impl LvInfo {
    #[inline]
    pub fn is_thin_pool(&self) -> bool {
        self.segtype == "thin-pool"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub vg_name: String,
    pub size_bytes: u64,
    /// Sum of the virtual sizes of the thin volumes allocated from the pool.
    pub virtual_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvCreate {
    pub vg: String,
    pub name: String,
    pub size_bytes: u64,
    pub thin_pool: Option<String>,
    pub stripe: Option<u32>,
    pub stripe_size: Option<String>,
    pub tags: Vec<String>,
    /// Raw `lvcreate` arguments from the device class and option class.
    pub extra_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCreate {
    pub vg: String,
    pub source: String,
    pub name: String,
    pub access: AccessType,
    pub tags: Vec<String>,
}

/// Narrow command interface to the host volume-group system. Every call is
/// synchronous and either fully succeeds or changes nothing.
pub trait LvmPort: Send + Sync {
    fn list_volume_groups(&self) -> Result<Vec<VgInfo>>;
    fn list_lvs(&self, vg: &str) -> Result<Vec<LvInfo>>;
    fn create_lv(&self, req: &LvCreate) -> Result<()>;
    fn resize_lv(&self, vg: &str, name: &str, size_bytes: u64) -> Result<()>;
    fn remove_lv(&self, vg: &str, name: &str) -> Result<()>;
    fn create_snapshot(&self, req: &SnapshotCreate) -> Result<()>;

    fn find_pool(&self, vg: &str, pool: &str) -> Result<Option<PoolInfo>> {
        let lvs = self.list_lvs(vg)?;
        let Some(p) = lvs.iter().find(|lv| lv.lv_name == pool && lv.is_thin_pool()) else {
            return Ok(None);
        };
        let virtual_bytes = lvs
            .iter()
            .filter(|lv| lv.pool_lv.as_deref() == Some(pool))
            .map(|lv| lv.size_bytes)
            .sum();
        Ok(Some(PoolInfo {
            name: p.lv_name.clone(),
            vg_name: p.vg_name.clone(),
            size_bytes: p.size_bytes,
            virtual_bytes,
        }))
    }
}

#[derive(Deserialize)]
struct VgsJson {
    report: Vec<VgReport>,
}

#[derive(Deserialize)]
struct VgReport {
    #[serde(default)]
    vg: Vec<VgRow>,
}

#[derive(Deserialize)]
struct VgRow {
    vg_name: String,
    vg_size: String,
    vg_free: String,
}

#[derive(Deserialize)]
struct LvsJson {
    report: Vec<LvReport>,
}

#[derive(Deserialize)]
struct LvReport {
    #[serde(default)]
    lv: Vec<LvRow>,
}

#[derive(Deserialize)]
struct LvRow {
    lv_name: String,
    vg_name: String,
    lv_size: String,
    #[serde(default)]
    segtype: String,
    #[serde(default)]
    pool_lv: String,
    #[serde(default)]
    origin: String,
    #[serde(default)]
    lv_tags: String,
}

type DynRunner = dyn Runner + Send + Sync;

pub struct LvmCli {
    runner: Arc<DynRunner>,
    lvm_path: String,
}

impl LvmCli {
    pub fn new(runner: Arc<DynRunner>, lvm_path: impl Into<String>) -> Self {
        Self {
            runner,
            lvm_path: lvm_path.into(),
        }
    }

    #[inline]
    fn lvm(&self, sub: &str) -> CmdSpec {
        CmdSpec::new(self.lvm_path.as_str())
            .env("LVM_SUPPRESS_FD_WARNINGS", "1")
            .arg(sub)
    }

    #[inline]
    fn exec(&self, cmd: CmdSpec) -> Result<String> {
        self.runner.run(&cmd)
    }
}

impl LvmPort for LvmCli {
    fn list_volume_groups(&self) -> Result<Vec<VgInfo>> {
        let cmd = self.lvm("vgs").args([
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "vg_name,vg_size,vg_free",
        ]);
        parse_vgs(&self.exec(cmd)?)
    }

    fn list_lvs(&self, vg: &str) -> Result<Vec<LvInfo>> {
        let cmd = self.lvm("lvs").args([
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "lv_name,vg_name,lv_size,segtype,pool_lv,origin,lv_tags",
            vg,
        ]);
        parse_lvs(&self.exec(cmd)?)
    }

    fn create_lv(&self, req: &LvCreate) -> Result<()> {
        let mut cmd = self
            .lvm("lvcreate")
            .args(["-y", "-W", "y", "-n", req.name.as_str()]);
        match &req.thin_pool {
            Some(pool) => {
                cmd = cmd
                    .args(["-T", &format!("{}/{pool}", req.vg)])
                    .args(["-V", &format!("{}b", req.size_bytes)]);
            }
            None => {
                cmd = cmd.args(["-L", &format!("{}b", req.size_bytes)]);
                if let Some(stripe) = req.stripe {
                    cmd = cmd.args(["-i".to_string(), stripe.to_string()]);
                }
                if let Some(size) = &req.stripe_size {
                    cmd = cmd.args(["-I", size.as_str()]);
                }
            }
        }
        for tag in &req.tags {
            cmd = cmd.args(["--addtag", tag.as_str()]);
        }
        cmd = cmd.args(req.extra_options.iter().cloned());
        if req.thin_pool.is_none() {
            cmd = cmd.arg(req.vg.as_str());
        }
        self.exec(cmd).map(drop)
    }

    fn resize_lv(&self, vg: &str, name: &str, size_bytes: u64) -> Result<()> {
        let cmd = self.lvm("lvresize").args([
            "-y".to_string(),
            "-L".to_string(),
            format!("{size_bytes}b"),
            format!("{vg}/{name}"),
        ]);
        self.exec(cmd).map(drop)
    }

    fn remove_lv(&self, vg: &str, name: &str) -> Result<()> {
        let cmd = self.lvm("lvremove").args(["-f".to_string(), format!("{vg}/{name}")]);
        self.exec(cmd).map(drop)
    }

    fn create_snapshot(&self, req: &SnapshotCreate) -> Result<()> {
        let mut cmd = self.lvm("lvcreate").args([
            "-y",
            "-s",
            "-k",
            "n",
            "-n",
            req.name.as_str(),
            "-p",
            req.access.permission(),
        ]);
        for tag in &req.tags {
            cmd = cmd.args(["--addtag", tag.as_str()]);
        }
        cmd = cmd.arg(format!("{}/{}", req.vg, req.source));
        self.exec(cmd).map(drop)
    }
}

fn parse_size(field: &str, raw: &str) -> Result<u64> {
    let trimmed = raw.trim().trim_end_matches(['B', 'b']);
    trimmed
        .parse::<u64>()
        .map_err(|_| anyhow!("bad {field} value '{raw}'"))
}

#[inline]
fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

fn parse_vgs(out: &str) -> Result<Vec<VgInfo>> {
    let json: VgsJson = serde_json::from_str(out).context("parse vgs json")?;
    json.report
        .into_iter()
        .flat_map(|r| r.vg)
        .map(|r| {
            Ok(VgInfo {
                size_bytes: parse_size("vg_size", &r.vg_size)?,
                free_bytes: parse_size("vg_free", &r.vg_free)?,
                name: r.vg_name,
            })
        })
        .collect()
}

fn parse_lvs(out: &str) -> Result<Vec<LvInfo>> {
    let json: LvsJson = serde_json::from_str(out).context("parse lvs json")?;
    json.report
        .into_iter()
        .flat_map(|r| r.lv)
        .map(|r| {
            Ok(LvInfo {
                size_bytes: parse_size("lv_size", &r.lv_size)?,
                tags: r
                    .lv_tags
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect(),
                lv_name: r.lv_name,
                vg_name: r.vg_name,
                segtype: r.segtype,
                pool_lv: non_empty(r.pool_lv),
                origin: non_empty(r.origin),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use super::*;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<CmdSpec>>,
        outputs: Mutex<VecDeque<String>>,
    }

    impl RecordingRunner {
        fn with_output(out: &str) -> Self {
            let r = Self::default();
            r.outputs.lock().unwrap().push_back(out.to_string());
            r
        }

        fn last_args(&self) -> String {
            let calls = self.calls.lock().unwrap();
            calls.last().unwrap().get_args().join(" ")
        }
    }

    impl Runner for RecordingRunner {
        fn run(&self, cmd: &CmdSpec) -> Result<String> {
            self.calls.lock().unwrap().push(cmd.clone());
            Ok(self.outputs.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    const LVS: &str = r#"{
      "report": [{
        "lv": [
          {"lv_name":"pool0","vg_name":"vg","lv_size":"107374182400","segtype":"thin-pool","pool_lv":"","origin":"","lv_tags":""},
          {"lv_name":"a","vg_name":"vg","lv_size":"10737418240","segtype":"thin","pool_lv":"pool0","origin":"","lv_tags":"k8s,pvc-1"},
          {"lv_name":"a-snap","vg_name":"vg","lv_size":"10737418240","segtype":"thin","pool_lv":"pool0","origin":"a","lv_tags":""},
          {"lv_name":"plain","vg_name":"vg","lv_size":"4194304","segtype":"linear","pool_lv":"","origin":"","lv_tags":""}
        ]
      }]
    }"#;

    fn cli(runner: Arc<RecordingRunner>) -> LvmCli {
        LvmCli::new(runner, DEFAULT_LVM_PATH)
    }

    #[test]
    fn parses_vgs_report() {
        let out = r#"{"report":[{"vg":[{"vg_name":"vg-ssd","vg_size":"107374182400","vg_free":"42949672960"}]}]}"#;
        let runner = Arc::new(RecordingRunner::with_output(out));
        let vgs = cli(runner.clone()).list_volume_groups().unwrap();
        assert_eq!(
            vgs,
            vec![VgInfo {
                name: "vg-ssd".into(),
                size_bytes: 100 << 30,
                free_bytes: 40 << 30,
            }]
        );
        assert!(runner.last_args().starts_with("vgs --reportformat json"));
    }

    #[test]
    fn parses_lvs_report() {
        let runner = Arc::new(RecordingRunner::with_output(LVS));
        let lvs = cli(runner).list_lvs("vg").unwrap();
        assert_eq!(lvs.len(), 4);
        assert!(lvs[0].is_thin_pool());
        assert_eq!(lvs[1].pool_lv.as_deref(), Some("pool0"));
        assert!(lvs[1].tags.contains("pvc-1"));
        assert_eq!(lvs[2].origin.as_deref(), Some("a"));
        assert_eq!(lvs[3].pool_lv, None);
    }

    #[test]
    fn find_pool_sums_virtual_sizes() {
        let runner = Arc::new(RecordingRunner::with_output(LVS));
        let pool = cli(runner).find_pool("vg", "pool0").unwrap().unwrap();
        assert_eq!(pool.size_bytes, 100 << 30);
        assert_eq!(pool.virtual_bytes, 20 << 30);
    }

    #[test]
    fn find_pool_missing() {
        let runner = Arc::new(RecordingRunner::with_output(LVS));
        assert_eq!(cli(runner).find_pool("vg", "plain").unwrap(), None);
    }

    #[test]
    fn bad_size_is_an_error() {
        let out = r#"{"report":[{"vg":[{"vg_name":"vg","vg_size":"10g","vg_free":"0"}]}]}"#;
        let runner = Arc::new(RecordingRunner::with_output(out));
        assert!(cli(runner).list_volume_groups().is_err());
    }

    #[test]
    fn lvcreate_full_with_stripes_and_options() {
        let runner = Arc::new(RecordingRunner::default());
        cli(runner.clone())
            .create_lv(&LvCreate {
                vg: "vg".into(),
                name: "pvc-1".into(),
                size_bytes: 1 << 30,
                thin_pool: None,
                stripe: Some(2),
                stripe_size: Some("64k".into()),
                tags: vec!["k8s".into()],
                extra_options: vec!["--type=raid1".into()],
            })
            .unwrap();
        assert_eq!(
            runner.last_args(),
            "lvcreate -y -W y -n pvc-1 -L 1073741824b -i 2 -I 64k --addtag k8s --type=raid1 vg"
        );
    }

    #[test]
    fn lvcreate_thin() {
        let runner = Arc::new(RecordingRunner::default());
        cli(runner.clone())
            .create_lv(&LvCreate {
                vg: "vg".into(),
                name: "pvc-2".into(),
                size_bytes: 4096,
                thin_pool: Some("pool0".into()),
                stripe: Some(2),
                stripe_size: None,
                tags: vec![],
                extra_options: vec![],
            })
            .unwrap();
        assert_eq!(
            runner.last_args(),
            "lvcreate -y -W y -n pvc-2 -T vg/pool0 -V 4096b"
        );
    }

    #[test]
    fn snapshot_resize_remove_commands() {
        let runner = Arc::new(RecordingRunner::default());
        let lvm = cli(runner.clone());

        lvm.create_snapshot(&SnapshotCreate {
            vg: "vg".into(),
            source: "a".into(),
            name: "a-snap".into(),
            access: AccessType::ReadOnly,
            tags: vec![],
        })
        .unwrap();
        assert_eq!(
            runner.last_args(),
            "lvcreate -y -s -k n -n a-snap -p r vg/a"
        );

        lvm.resize_lv("vg", "a", 2048).unwrap();
        assert_eq!(runner.last_args(), "lvresize -y -L 2048b vg/a");

        lvm.remove_lv("vg", "a").unwrap();
        assert_eq!(runner.last_args(), "lvremove -f vg/a");
    }
}
