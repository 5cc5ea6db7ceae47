//! End-to-end behaviour of the sync core against the in-memory backend.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tenantsync_app::{
    ChangeSource, CoreConfig, DataType, ScheduleMode, SyncCore, SyncStatus, TenantId,
};
use tenantsync_storage::{BroadcastNotifier, ChangeNotifier, KeyValueStore, MemoryStore};
use tenantsync_sync::MemoryBackend;

fn config(tenant: &str) -> CoreConfig {
    CoreConfig {
        tenant: Some(tenant.to_string()),
        sync_mode: ScheduleMode::Manual,
        ..CoreConfig::default()
    }
}

fn core_with(backend: Arc<MemoryBackend>, tenant: &str) -> SyncCore {
    SyncCore::builder(config(tenant))
        .backend(backend)
        .build()
        .unwrap()
}

fn t1() -> TenantId {
    TenantId::new("T1").unwrap()
}

fn arb_payload() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::hash_map("[a-z]{1,8}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_push_then_pull_roundtrip(
        data_type in prop::sample::select(DataType::ALL.to_vec()),
        payload in arb_payload(),
        rpc in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let pulled = runtime.block_on(async {
            let backend = Arc::new(MemoryBackend::new());
            backend.set_rpc_enabled(rpc);
            let core = core_with(backend, "T1");
            let client = core.client();

            assert!(client.ensure_tenant_exists(&t1()).await);
            assert!(client.push(&t1(), data_type, payload.clone()).await);
            client.pull(&t1(), data_type).await
        });
        prop_assert_eq!(pulled, Some(payload));
    }
}

#[tokio::test]
async fn scenario_services_roundtrip() {
    let backend = Arc::new(MemoryBackend::new());
    let core = core_with(backend, "T1");
    let services = json!([{"id": "a"}, {"id": "b"}, {"id": "c"}]);

    assert!(core.client().ensure_tenant_exists(&t1()).await);
    assert!(core.client().push(&t1(), DataType::Services, services.clone()).await);

    let pulled = core.client().pull(&t1(), DataType::Services).await.unwrap();
    assert_eq!(pulled.as_array().unwrap().len(), 3);
    assert_eq!(pulled, services);
}

#[tokio::test]
async fn scenario_two_tabs_see_each_others_writes() {
    let profile: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let notifier: Arc<dyn ChangeNotifier> = Arc::new(BroadcastNotifier::new());
    let backend = Arc::new(MemoryBackend::new());

    let tab = || {
        SyncCore::builder(config("T1"))
            .store(profile.clone())
            .notifier(notifier.clone())
            .backend(backend.clone())
            .build()
            .unwrap()
    };
    let tab_a = tab();
    let tab_b = tab();
    tab_a.start();
    tab_b.start();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = tab_b.subscribe(DataType::Settings, move |event| {
        let _ = tx.send((event.payload.clone(), event.source));
    });

    assert!(tab_a.write(DataType::Settings, json!({"salonName": "Spa X"})));

    let (payload, source) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, Some(json!({"salonName": "Spa X"})));
    assert_eq!(source, ChangeSource::CrossTab);
    assert_eq!(tab_b.read(DataType::Settings), Some(json!({"salonName": "Spa X"})));

    // Only the writing tab owes a push.
    assert!(tab_a.get_sync_status().has_pending_changes());
    assert!(!tab_b.get_sync_status().has_pending_changes());
    assert_eq!(tab_a.get_current_device_id(), tab_b.get_current_device_id());

    tab_a.shutdown().await;
    tab_b.shutdown().await;
}

#[tokio::test]
async fn scenario_active_theme_crosses_tabs() {
    let profile: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let notifier: Arc<dyn ChangeNotifier> = Arc::new(BroadcastNotifier::new());
    let tab = || {
        SyncCore::builder(config("T1"))
            .store(profile.clone())
            .notifier(notifier.clone())
            .build()
            .unwrap()
    };
    let tab_a = tab();
    let tab_b = tab();
    tab_b.start();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = tab_b.subscribe_key("activeThemeId", move |event| {
        let _ = tx.send(event.payload.clone());
    });

    tab_a.set_active_theme_id("ocean");

    let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, Some(json!("ocean")));
    assert_eq!(tab_b.active_theme_id().as_deref(), Some("ocean"));
    tab_b.shutdown().await;
}

#[tokio::test]
async fn scenario_rpc_failure_falls_back_to_direct_upsert() {
    let backend = Arc::new(MemoryBackend::new());
    backend.fail_rpc("update_sync_data");
    let core = core_with(backend.clone(), "T1");

    core.write(DataType::Settings, json!({"salonName": "Spa X"}));
    core.force_sync_all().await;

    let status = core.get_sync_status();
    assert_eq!(status.status_of(DataType::Settings), SyncStatus::Synced);
    assert_eq!(backend.rows("sync_data")[0]["data"], json!({"salonName": "Spa X"}));
}

#[tokio::test]
async fn scenario_offline_mid_cycle() {
    let backend = Arc::new(MemoryBackend::new());
    let core = Arc::new(core_with(backend.clone(), "T1"));
    core.force_sync_all().await;

    for data_type in DataType::ALL {
        core.write(data_type, json!({"edited": data_type.as_str()}));
    }
    backend.set_latency(Some(Duration::from_millis(20)));

    let cycle = {
        let core = core.clone();
        tokio::spawn(async move { core.force_sync_all().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    core.set_online(false);
    let result = cycle.await.unwrap();

    assert_eq!(result.types_failed, 0);
    for entry in core.get_sync_status().entries() {
        assert!(
            matches!(entry.status, SyncStatus::Pending | SyncStatus::Synced),
            "{} ended as {:?}",
            entry.data_type,
            entry.status
        );
    }
}

#[tokio::test]
async fn scenario_missing_tenant_is_created_before_push() {
    let backend = Arc::new(MemoryBackend::new());
    let core = core_with(backend.clone(), "T1");

    assert!(backend.rows("tenants").is_empty());
    assert!(!core.client().push(&t1(), DataType::Staff, json!([])).await);

    assert!(core.ensure_tenant().await);
    assert_eq!(backend.rows("tenants")[0]["id"], "T1");
    assert!(core.client().push(&t1(), DataType::Staff, json!(["ana"])).await);
}

#[tokio::test]
async fn idempotent_push_keeps_payload() {
    let backend = Arc::new(MemoryBackend::new());
    let core = core_with(backend.clone(), "T1");
    core.ensure_tenant().await;

    let payload = json!({"openingHours": [9, 18]});
    core.client().push(&t1(), DataType::Settings, payload.clone()).await;
    let first = backend.rows("sync_data")[0].clone();
    core.client().push(&t1(), DataType::Settings, payload.clone()).await;
    let second = backend.rows("sync_data")[0].clone();

    assert_eq!(first["data"], second["data"]);
    assert_eq!(backend.rows("sync_data").len(), 1);
}

#[tokio::test]
async fn overlapping_force_sync_is_a_no_op() {
    let backend = Arc::new(MemoryBackend::new());
    let core = Arc::new(core_with(backend.clone(), "T1"));
    core.write(DataType::Staff, json!(["ana"]));
    backend.set_latency(Some(Duration::from_millis(30)));

    let first = {
        let core = core.clone();
        tokio::spawn(async move { core.force_sync_all().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let before = core.get_sync_status();
    let second = core.force_sync_all().await;
    let after = core.get_sync_status();

    assert!(second.skipped);
    for data_type in DataType::ALL {
        assert_eq!(before.status_of(data_type), after.status_of(data_type));
    }
    assert!(!first.await.unwrap().skipped);
}

#[tokio::test]
async fn offline_operations_fail_fast() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_latency(Some(Duration::from_secs(30)));
    let core = core_with(backend.clone(), "T1");
    core.set_online(false);
    core.write(DataType::Themes, json!({"primary": "#112233"}));

    let started = Instant::now();
    assert!(!core.client().push(&t1(), DataType::Themes, json!({})).await);
    assert!(core.client().pull(&t1(), DataType::Themes).await.is_none());
    assert!(!core.resolve_conflict(DataType::Themes, json!({})).await);
    let result = core.force_sync_all().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(result.types_failed, 0);
    assert_eq!(
        core.get_sync_status().status_of(DataType::Themes),
        SyncStatus::Pending
    );
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn fallback_matches_procedure_path() {
    let with_rpc = Arc::new(MemoryBackend::new());
    let without_rpc = Arc::new(MemoryBackend::new());
    without_rpc.set_rpc_enabled(false);

    for backend in [&with_rpc, &without_rpc] {
        let core = core_with(backend.clone(), "T1");
        core.write(DataType::Services, json!([{"id": "a"}]));
        core.write(DataType::Staff, json!(["ana"]));
        core.force_sync_all().await;
        core.write(DataType::Services, json!([{"id": "a"}, {"id": "b"}]));
        core.force_sync_all().await;
    }

    let shape = |backend: &MemoryBackend| {
        let mut rows: Vec<Value> = backend
            .rows("sync_data")
            .into_iter()
            .map(|row| {
                json!({
                    "tenant_id": row["tenant_id"],
                    "data_type": row["data_type"],
                    "data": row["data"],
                    "version": row["version"],
                })
            })
            .collect();
        rows.sort_by_key(|row| row["data_type"].to_string());
        rows
    };

    assert_eq!(shape(&with_rpc), shape(&without_rpc));
    assert!(without_rpc.calls().contains(&"upsert:sync_data".to_string()));
    assert!(!with_rpc.calls().contains(&"upsert:sync_data".to_string()));
}

#[test]
fn throwing_listener_does_not_block_others() {
    let core = SyncCore::builder(config("T1")).build().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = seen.clone();
    let _a = core.subscribe(DataType::Staff, move |_| first.lock().unwrap().push("first"));
    let _b = core.subscribe(DataType::Staff, |_| panic!("broken consumer"));
    let last = seen.clone();
    let _c = core.subscribe(DataType::Staff, move |_| last.lock().unwrap().push("last"));

    assert!(core.write(DataType::Staff, json!([])));
    assert_eq!(*seen.lock().unwrap(), vec!["first", "last"]);
}

#[tokio::test]
async fn second_device_changes_are_pulled() {
    let backend = Arc::new(MemoryBackend::new());
    let laptop = core_with(backend.clone(), "T1");
    let phone = core_with(backend.clone(), "T1");
    assert_ne!(laptop.get_current_device_id(), phone.get_current_device_id());

    laptop.write(DataType::Appointments, json!([{"at": "10:00"}]));
    laptop.force_sync_all().await;

    let result = phone.hydrate().await;
    assert_eq!(result.types_failed, 0);
    assert_eq!(phone.read(DataType::Appointments), Some(json!([{"at": "10:00"}])));

    phone.write(DataType::Appointments, json!([{"at": "11:00"}]));
    phone.force_sync_all().await;
    laptop.force_sync_all().await;
    assert_eq!(laptop.read(DataType::Appointments), Some(json!([{"at": "11:00"}])));
}

#[tokio::test]
async fn unpushed_write_survives_a_reload() {
    let profile: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let tab = || {
        SyncCore::builder(config("T1"))
            .store(profile.clone())
            .backend(backend.clone())
            .build()
            .unwrap()
    };

    let other_device = core_with(backend.clone(), "T1");
    other_device.write(DataType::Settings, json!({"salonName": "old"}));
    other_device.force_sync_all().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let before_reload = tab();
    before_reload.set_online(false);
    assert!(before_reload.write(DataType::Settings, json!({"salonName": "new"})));
    before_reload.shutdown().await;
    drop(before_reload);

    let after_reload = tab();
    assert!(after_reload.get_sync_status().has_pending_changes());
    after_reload.force_sync_all().await;

    assert_eq!(after_reload.read(DataType::Settings), Some(json!({"salonName": "new"})));
    assert_eq!(
        after_reload.get_sync_status().status_of(DataType::Settings),
        SyncStatus::Synced
    );
    other_device.force_sync_all().await;
    assert_eq!(other_device.read(DataType::Settings), Some(json!({"salonName": "new"})));
}

#[tokio::test]
async fn switching_tenants_back_keeps_unpushed_write() {
    let backend = Arc::new(MemoryBackend::new());
    let other_device = core_with(backend.clone(), "T1");
    other_device.write(DataType::Staff, json!(["old"]));
    other_device.force_sync_all().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let tab = core_with(backend.clone(), "T1");
    tab.write(DataType::Staff, json!(["new"]));
    tab.set_tenant(Some(TenantId::new("T2").unwrap()));
    tab.set_tenant(Some(t1()));
    tab.force_sync_all().await;

    assert_eq!(tab.read(DataType::Staff), Some(json!(["new"])));
    assert_eq!(tab.client().pull(&t1(), DataType::Staff).await, Some(json!(["new"])));
}

#[tokio::test]
async fn tenant_switch_mid_cycle_keeps_tenants_apart() {
    let backend = Arc::new(MemoryBackend::new());
    let t2_device = core_with(backend.clone(), "T2");
    t2_device.write(DataType::Staff, json!(["t2-staff"]));
    t2_device.force_sync_all().await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let t1_device = core_with(backend.clone(), "T1");
    t1_device.write(DataType::Staff, json!(["t1-staff"]));
    t1_device.force_sync_all().await;

    let tab = Arc::new(core_with(backend.clone(), "T1"));
    backend.set_latency(Some(Duration::from_millis(10)));
    let first = {
        let tab = tab.clone();
        tokio::spawn(async move { tab.force_sync_all().await })
    };
    tokio::time::sleep(Duration::from_millis(15)).await;
    tab.set_tenant(Some(TenantId::new("T2").unwrap()));
    assert!(!first.await.unwrap().skipped);

    backend.set_latency(None);
    let second = tab.force_sync_all().await;
    assert_eq!(second.types_failed, 0);
    assert_eq!(tab.read(DataType::Staff), Some(json!(["t2-staff"])));

    tab.set_tenant(Some(t1()));
    assert_eq!(tab.read(DataType::Staff), Some(json!(["t1-staff"])));
}
