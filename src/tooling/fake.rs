//! In-memory executor for tests: simulates volume groups, thin pools and
//! capacity, with injectable failures and latency.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{Result, anyhow, bail};

use super::lvm::{LvCreate, LvInfo, LvmPort, SnapshotCreate, VgInfo};
use crate::volume::GIB;

#[derive(Default)]
struct State {
    vgs: BTreeMap<String, u64>,
    lvs: Vec<LvInfo>,
    failing: bool,
    delay: Duration,
    created: Vec<LvCreate>,
    snapshots: Vec<SnapshotCreate>,
}

impl State {
    fn vg_free(&self, vg: &str) -> Result<u64> {
        let size = *self
            .vgs
            .get(vg)
            .ok_or_else(|| anyhow!("Volume group \"{vg}\" not found"))?;
        let used: u64 = self
            .lvs
            .iter()
            .filter(|lv| lv.vg_name == vg && lv.pool_lv.is_none())
            .map(|lv| lv.size_bytes)
            .sum();
        Ok(size.saturating_sub(used))
    }

    fn find(&self, vg: &str, name: &str) -> Option<usize> {
        self.lvs
            .iter()
            .position(|lv| lv.vg_name == vg && lv.lv_name == name)
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing {
            bail!("injected failure: device-mapper: reload ioctl failed");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLvm {
    state: Mutex<State>,
}

impl FakeLvm {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_vg(self, vg: &str, size_gib: u64) -> Self {
        self.state().vgs.insert(vg.to_string(), size_gib * GIB);
        self
    }

    pub fn with_lv(self, vg: &str, name: &str, size_gib: u64) -> Self {
        self.state().lvs.push(lv(vg, name, size_gib * GIB, "linear", None));
        self
    }

    pub fn with_pool(self, vg: &str, pool: &str, size_gib: u64) -> Self {
        self.state().lvs.push(lv(vg, pool, size_gib * GIB, "thin-pool", None));
        self
    }

    pub fn with_thin_lv(self, vg: &str, pool: &str, name: &str, size_gib: u64) -> Self {
        self.state()
            .lvs
            .push(lv(vg, name, size_gib * GIB, "thin", Some(pool)));
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Latency injected between reading and committing a mutation.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    pub fn remove_vg(&self, vg: &str) {
        let mut st = self.state();
        st.vgs.remove(vg);
        st.lvs.retain(|lv| lv.vg_name != vg);
    }

    pub fn created(&self) -> Vec<LvCreate> {
        self.state().created.clone()
    }

    pub fn snapshots(&self) -> Vec<SnapshotCreate> {
        self.state().snapshots.clone()
    }

    fn pause(&self) {
        let delay = self.state().delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

fn lv(vg: &str, name: &str, size_bytes: u64, segtype: &str, pool: Option<&str>) -> LvInfo {
    LvInfo {
        lv_name: name.to_string(),
        vg_name: vg.to_string(),
        size_bytes,
        segtype: segtype.to_string(),
        pool_lv: pool.map(String::from),
        origin: None,
        tags: BTreeSet::new(),
    }
}

impl LvmPort for FakeLvm {
    fn list_volume_groups(&self) -> Result<Vec<VgInfo>> {
        let st = self.state();
        st.vgs
            .iter()
            .map(|(name, size)| {
                Ok(VgInfo {
                    name: name.clone(),
                    size_bytes: *size,
                    free_bytes: st.vg_free(name)?,
                })
            })
            .collect()
    }

    fn list_lvs(&self, vg: &str) -> Result<Vec<LvInfo>> {
        let st = self.state();
        if !st.vgs.contains_key(vg) {
            bail!("Volume group \"{vg}\" not found");
        }
        Ok(st.lvs.iter().filter(|lv| lv.vg_name == vg).cloned().collect())
    }

    fn create_lv(&self, req: &LvCreate) -> Result<()> {
        self.state().check_failing()?;
        self.pause();

        let mut st = self.state();
        if st.find(&req.vg, &req.name).is_some() {
            bail!("Logical Volume \"{}\" already exists", req.name);
        }
        let mut new = match &req.thin_pool {
            Some(pool) => {
                if st.find(&req.vg, pool).is_none() {
                    bail!("thin pool {}/{pool} not found", req.vg);
                }
                lv(&req.vg, &req.name, req.size_bytes, "thin", Some(pool))
            }
            None => {
                if req.size_bytes > st.vg_free(&req.vg)? {
                    bail!("Volume group \"{}\" has insufficient free space", req.vg);
                }
                lv(&req.vg, &req.name, req.size_bytes, "linear", None)
            }
        };
        new.tags = req.tags.iter().cloned().collect();
        st.lvs.push(new);
        st.created.push(req.clone());
        Ok(())
    }

    fn resize_lv(&self, vg: &str, name: &str, size_bytes: u64) -> Result<()> {
        self.state().check_failing()?;
        self.pause();

        let mut st = self.state();
        let idx = st
            .find(vg, name)
            .ok_or_else(|| anyhow!("Failed to find logical volume \"{vg}/{name}\""))?;
        if st.lvs[idx].pool_lv.is_none() {
            let grow = size_bytes.saturating_sub(st.lvs[idx].size_bytes);
            if grow > st.vg_free(vg)? {
                bail!("Insufficient free space");
            }
        }
        st.lvs[idx].size_bytes = size_bytes;
        Ok(())
    }

    fn remove_lv(&self, vg: &str, name: &str) -> Result<()> {
        self.state().check_failing()?;
        self.pause();

        let mut st = self.state();
        let idx = st
            .find(vg, name)
            .ok_or_else(|| anyhow!("Failed to find logical volume \"{vg}/{name}\""))?;
        st.lvs.remove(idx);
        Ok(())
    }

    fn create_snapshot(&self, req: &SnapshotCreate) -> Result<()> {
        self.state().check_failing()?;
        self.pause();

        let mut st = self.state();
        let idx = st
            .find(&req.vg, &req.source)
            .ok_or_else(|| anyhow!("Failed to find logical volume \"{}\"", req.source))?;
        if st.find(&req.vg, &req.name).is_some() {
            bail!("Logical Volume \"{}\" already exists", req.name);
        }
        let src = st.lvs[idx].clone();
        let mut snap = lv(
            &req.vg,
            &req.name,
            src.size_bytes,
            &src.segtype,
            src.pool_lv.as_deref(),
        );
        snap.origin = Some(src.lv_name);
        snap.tags = req.tags.iter().cloned().collect();
        st.lvs.push(snap);
        st.snapshots.push(req.clone());
        Ok(())
    }
}
