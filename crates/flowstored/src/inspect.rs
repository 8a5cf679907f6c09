//! Inspect mode: dump what a replica persisted.

use std::path::Path;

use anyhow::Context;
use serde_json::json;

use flowstore_core::DeviceId;
use flowstore_state::StateStore;

use crate::DB_FILE;

pub fn run(data_dir: &Path, device: Option<&str>) -> anyhow::Result<()> {
    let path = data_dir.join(DB_FILE);
    anyhow::ensure!(path.exists(), "no state store at {}", path.display());
    let state = StateStore::open(&path).with_context(|| format!("opening {}", path.display()))?;

    let device = device.map(DeviceId::parse).transpose()?;
    let report = report(&state, device.as_ref())?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Snapshots and mastership records, optionally narrowed to one device.
fn report(state: &StateStore, device: Option<&DeviceId>) -> anyhow::Result<serde_json::Value> {
    let (snapshots, mastership) = match device {
        Some(device_id) => {
            let snapshot = state
                .get_snapshot(device_id)?
                .with_context(|| format!("no snapshot for {device_id}"))?;
            (vec![snapshot], state.get_mastership(device_id)?.into_iter().collect())
        }
        None => (state.list_snapshots()?, state.list_mastership()?),
    };

    Ok(json!({
        "devices": snapshots
            .iter()
            .map(|s| json!({
                "device_id": s.device_id,
                "epoch": s.epoch,
                "version": s.version,
                "next_table_id": s.next_table_id,
                "table_id_space": s.table_id_space,
                "bindings": s.bindings,
                "tables": s.tables,
                "entries": s.entries,
                "recent_ops": s.recent_ops.len(),
                "taken_at": s.taken_at,
            }))
            .collect::<Vec<_>>(),
        "mastership": mastership,
    }))
}
