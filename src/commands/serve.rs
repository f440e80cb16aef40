use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing as log;

use crate::{
    AppCtx,
    rpc::server::{Handlers, RpcServer},
    service::{
        CapacityNotifier, DeviceClassManager, LvService, LvcreateOptionClassManager, VgService,
        notifier::RECONCILE_INTERVAL,
    },
    tooling::{self, LvmPort},
    utils::lock::LockGuard,
};

/// Daemon entry point. Startup checks run before the runtime exists; any
/// failure there is fatal.
pub fn run(ctx: AppCtx) -> Result<()> {
    let cfg = ctx.cfg;
    let lvm = tooling::host_lvm(&ctx.lvm_path, ctx.container)?;
    let dcm = Arc::new(DeviceClassManager::new(cfg.device_classes));
    check_device_classes(lvm.as_ref(), &dcm)?;
    let ocm = Arc::new(LvcreateOptionClassManager::new(cfg.lvcreate_option_classes));

    let lock = LockGuard::for_socket(&cfg.socket_name)?;
    log::debug!(path = %lock.path().display(), "instance lock held");

    let notifier = CapacityNotifier::new();
    let handlers = Handlers::new(
        VgService::new(dcm.clone(), lvm.clone(), notifier.clone()),
        LvService::new(dcm.clone(), ocm, lvm, notifier.clone()),
    );
    log::info!(
        device_classes = dcm.classes().len(),
        containerized = ctx.container,
        lvm = %ctx.lvm_path,
        "starting lvmd"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(serve(&cfg.socket_name, handlers, notifier))
}

async fn serve(socket: &Path, handlers: Handlers, notifier: CapacityNotifier) -> Result<()> {
    let shutdown = CancellationToken::new();
    let server = RpcServer::bind(socket, handlers)?;
    let ticker = notifier.spawn_ticker(RECONCILE_INTERVAL, shutdown.clone());

    let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    let stop = shutdown.clone();
    let signals = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => log::info!("SIGTERM received, shutting down"),
        }
        stop.cancel();
    });

    server.serve(shutdown.clone()).await;
    shutdown.cancel();
    signals.abort();
    if let Err(e) = ticker.await {
        log::warn!(error = %e, "capacity ticker failed");
    }
    if let Err(e) = fs::remove_file(socket) {
        log::debug!(error = %e, "socket cleanup");
    }
    log::info!("lvmd stopped");
    Ok(())
}

/// Every class's volume group must exist, and so must the pool of every
/// thin class.
fn check_device_classes(lvm: &dyn LvmPort, dcm: &DeviceClassManager) -> Result<()> {
    let vgs = lvm.list_volume_groups().context("list volume groups")?;
    for dc in dcm.classes() {
        if !vgs.iter().any(|vg| vg.name == dc.volume_group) {
            bail!(
                "volume group '{}' of device class '{}' not found",
                dc.volume_group,
                dc.name
            );
        }
        if let Some(tp) = &dc.thin_pool {
            let pool = lvm
                .find_pool(&dc.volume_group, &tp.name)
                .with_context(|| format!("look up thin pool of device class '{}'", dc.name))?;
            if pool.is_none() {
                bail!(
                    "thin pool '{}/{}' of device class '{}' not found",
                    dc.volume_group,
                    tp.name,
                    dc.name
                );
            }
        }
        log::debug!(device_class = %dc.name, vg = %dc.volume_group, "device class ok");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        service::device_class::tests::{full, thin},
        tooling::fake::FakeLvm,
    };

    fn lvm() -> FakeLvm {
        FakeLvm::new()
            .with_vg("vg-ssd", 100)
            .with_vg("vg-thin", 100)
            .with_pool("vg-thin", "pool0", 50)
    }

    #[test]
    fn startup_accepts_present_groups_and_pools() {
        let dcm = DeviceClassManager::new(vec![
            full("ssd", "vg-ssd", 10),
            thin("thin", "vg-thin", "pool0", 2.0),
        ]);
        check_device_classes(&lvm(), &dcm).unwrap();
    }

    #[test]
    fn startup_rejects_missing_group_or_pool() {
        let missing_vg = DeviceClassManager::new(vec![full("hdd", "vg-hdd", 10)]);
        let err = check_device_classes(&lvm(), &missing_vg).unwrap_err();
        assert!(err.to_string().contains("vg-hdd"), "{err}");

        let missing_pool = DeviceClassManager::new(vec![thin("thin", "vg-thin", "pool9", 2.0)]);
        let err = check_device_classes(&lvm(), &missing_pool).unwrap_err();
        assert!(err.to_string().contains("pool9"), "{err}");
    }
}
