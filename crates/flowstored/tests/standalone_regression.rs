//! Standalone regression tests.
//!
//! Assembles a replica the way `flowstored run` does: redb under a data
//! directory, a loopback adapter, mastership claimed from the config. Then
//! restarts it from the same directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flowstore_cluster::{LocalNetwork, MastershipManager};
use flowstore_core::{
    BatchOperation, DeviceId, FlowEntryId, FlowEntryState, FlowOp, FlowRule, LogicalTableId,
    PiTableAction, StoreConfig, TableSpec, TableType,
};
use flowstore_engine::{AdapterRegistry, FlowService, FlowStore, MemoryAdapter, StoreDeps};
use flowstore_state::StateStore;

const CONFIG: &str = r#"
replica_id = "replica-1"
table_id_space = 8

[[devices]]
id = "pof:0000000000000001"
table_id_space = 2
"#;

struct Replica {
    store: FlowStore,
    mastership: Arc<MastershipManager>,
    adapter: Arc<MemoryAdapter>,
}

fn boot(dir: &Path, adapter: Arc<MemoryAdapter>) -> Replica {
    let mut config = StoreConfig::from_toml(CONFIG).unwrap();
    config.data_dir = Some(dir.to_path_buf());

    let state = StateStore::open(&dir.join("flowstore.redb")).unwrap();
    let mastership = Arc::new(MastershipManager::new(state.clone()).unwrap());
    let network = LocalNetwork::new();
    let inbox = network.register(&config.replica_id);
    let devices = config.devices.clone();
    let replica_id = config.replica_id.clone();

    let store = FlowStore::start(
        config,
        StoreDeps {
            mastership: mastership.clone(),
            transport: network,
            inbox,
            adapters: AdapterRegistry::new()
                .with("pof", adapter.clone())
                .with("of", adapter.clone()),
            state: Some(state),
        },
    )
    .unwrap();
    for device in &devices {
        mastership.assign(&device.id, &replica_id, vec![]).unwrap();
    }

    Replica {
        store,
        mastership,
        adapter,
    }
}

fn device() -> DeviceId {
    DeviceId::new("pof:0000000000000001")
}

fn add_table(op: u64, name: &str) -> BatchOperation {
    BatchOperation::new(
        op,
        FlowOp::AddTable(TableSpec {
            device_id: device(),
            name: name.to_string(),
            table_type: TableType::Linear,
            size: 16,
            match_fields: vec![],
            app_id: "org.example.app".to_string(),
        }),
    )
}

fn add_flow(op: u64, entry: u64, table: u64) -> BatchOperation {
    BatchOperation::new(
        op,
        FlowOp::AddFlow(FlowRule {
            id: FlowEntryId(entry),
            device_id: device(),
            table_id: LogicalTableId(table),
            priority: 10,
            app_id: "org.example.app".to_string(),
            criteria: vec![],
            actions: vec![PiTableAction::member(3)],
        }),
    )
}

async fn wait_for_master(store: &FlowStore) {
    for _ in 0..200 {
        if store.is_master(&device()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("replica never became master");
}

#[tokio::test]
async fn standalone_claims_configured_devices() {
    let dir = tempfile::tempdir().unwrap();
    let replica = boot(dir.path(), Arc::new(MemoryAdapter::new()));
    wait_for_master(&replica.store).await;

    let record = replica.mastership.get(&device()).unwrap();
    assert_eq!(record.master, "replica-1");
    assert_eq!(record.epoch, 1);
    assert_eq!(replica.store.devices().unwrap(), vec![device()]);

    replica.store.shutdown().await;
}

#[tokio::test]
async fn configured_table_space_caps_the_device() {
    let dir = tempfile::tempdir().unwrap();
    let replica = boot(dir.path(), Arc::new(MemoryAdapter::new()));
    let service = FlowService::new(replica.store.clone());

    let results = service
        .apply_tables(vec![add_table(1, "t0"), add_table(2, "t1"), add_table(3, "t2")])
        .await
        .unwrap();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    assert!(!results[2].is_ok());

    replica.store.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MemoryAdapter::new());

    let first = boot(dir.path(), adapter.clone());
    let service = FlowService::new(first.store.clone());
    service
        .apply_tables(vec![add_table(1, "t0"), add_table(2, "t1")])
        .await
        .unwrap();
    service
        .apply_flows(vec![add_flow(3, 100, 1), add_flow(4, 101, 2)])
        .await
        .unwrap();
    service.remove_table(&device(), LogicalTableId(2)).await.unwrap();
    first.store.shutdown().await;
    drop(service);
    drop(first);

    let second = boot(dir.path(), adapter);
    wait_for_master(&second.store).await;
    let service = FlowService::new(second.store.clone());

    let flows = service.list_flows(Some(&device())).await.unwrap();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].rule.id, FlowEntryId(100));
    assert_eq!(flows[0].state, FlowEntryState::Added);

    // Same master again: the epoch is unchanged and ids keep counting.
    assert_eq!(second.mastership.get(&device()).unwrap().epoch, 1);
    let results = service.apply_tables(vec![add_table(5, "t2")]).await.unwrap();
    assert_eq!(results[0].table_id, Some(LogicalTableId(3)));

    // Operation ids applied before the restart are still remembered.
    let again = service.apply_flows(vec![add_flow(3, 100, 1)]).await.unwrap();
    assert!(again[0].is_ok());
    assert_eq!(second.adapter.install_calls(&device(), FlowEntryId(100)), 1);

    second.store.shutdown().await;
}
