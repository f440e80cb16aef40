use prettytable::{Cell, Row, Table};

use crate::volume::{LogicalVolume, VolumeGroupSnapshot};

pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{v:.1} {}", UNITS[unit])
    }
}

pub fn volumes_table(lvs: &[LogicalVolume]) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Name"),
        Cell::new("VG"),
        Cell::new("Size"),
        Cell::new("Type"),
        Cell::new("Pool"),
        Cell::new("Origin"),
        Cell::new("Tags"),
    ]));
    for lv in lvs {
        let tags = lv.tags.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        table.add_row(Row::new(vec![
            Cell::new(&lv.name),
            Cell::new(&lv.vg_name),
            Cell::new(&human_bytes(lv.size_bytes)),
            Cell::new(&lv.provisioning.to_string()),
            Cell::new(lv.pool.as_deref().unwrap_or("-")),
            Cell::new(lv.origin.as_deref().unwrap_or("-")),
            Cell::new(&tags),
        ]));
    }
    table
}

pub fn print_volumes(lvs: &[LogicalVolume]) {
    if lvs.is_empty() {
        tracing::info!("<no logical volumes>");
    } else {
        volumes_table(lvs).printstd();
    }
}

pub fn print_snapshot(snap: &VolumeGroupSnapshot) {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Observed (UTC)"),
        Cell::new("Device class"),
        Cell::new("VG"),
        Cell::new("Total"),
        Cell::new("Free"),
    ]));
    table.add_row(Row::new(vec![
        Cell::new(&snap.observed_at),
        Cell::new(&snap.device_class),
        Cell::new(&snap.name),
        Cell::new(&human_bytes(snap.total_bytes)),
        Cell::new(&human_bytes(snap.free_bytes)),
    ]));
    table.printstd();
}
