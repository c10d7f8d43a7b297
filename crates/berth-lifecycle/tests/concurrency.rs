//! The full runtime under load: worker pool, monitor and deletions racing
//! in-flight provisioning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::{BerthConfig, SizeClass};
use berth_driver::drivers::DummyDriver;
use berth_driver::{DriverRegistry, StaticCredentialStore};
use berth_lifecycle::Orchestrator;
use berth_state::{Blueprint, InstanceState, StateStore};
use tokio::sync::watch;

fn orchestrator(driver: Arc<DummyDriver>, concurrency: usize) -> Arc<Orchestrator> {
    let store = StateStore::open_in_memory().unwrap();
    store
        .put_blueprint(&Blueprint {
            id: "web".into(),
            name: "web".into(),
            driver: "dummy".into(),
            size_class: SizeClass::Small,
            image: "nginx".into(),
            enabled: true,
            max_lifetime: None,
            config: BTreeMap::new(),
        })
        .unwrap();
    let mut config = BerthConfig::default();
    config.dispatch.concurrency = concurrency;
    let orch = Orchestrator::builder(
        config,
        store,
        DriverRegistry::new().with("dummy", driver),
        Arc::new(StaticCredentialStore::new()),
    )
    .build()
    .unwrap();
    Arc::new(orch)
}

async fn wait_for(orch: &Orchestrator, ids: &[String], state: InstanceState) {
    for _ in 0..600 {
        let done = ids
            .iter()
            .all(|id| orch.get_instance_status(id).unwrap().state == state);
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("instances never reached {state}");
}

#[tokio::test(start_paused = true)]
async fn workers_never_overlap_on_one_instance() {
    let driver = Arc::new(DummyDriver::new().with_delay(Duration::from_millis(300)));
    let orch = orchestrator(driver.clone(), 4);
    let ids: Vec<String> = (0..10)
        .map(|i| orch.create_instance("web", &format!("user-{i}")).unwrap())
        .collect();

    let (tx, rx) = watch::channel(false);
    let runner = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.run(rx).await })
    };

    wait_for(&orch, &ids, InstanceState::Running).await;
    for id in &ids {
        orch.delete_instance(id).unwrap();
    }
    wait_for(&orch, &ids, InstanceState::Deleted).await;

    tx.send(true).unwrap();
    runner.await.unwrap();

    let stats = driver.stats();
    assert_eq!(stats.provision_calls, 10);
    assert_eq!(stats.deprovision_calls, 10);
    assert_eq!(stats.overlapping_calls, 0);
    assert!(stats.peak_concurrency <= 4, "peak {}", stats.peak_concurrency);
    assert_eq!(driver.resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn deletion_during_provisioning_runs_right_after() {
    let driver = Arc::new(DummyDriver::new().with_delay(Duration::from_secs(2)));
    let orch = orchestrator(driver.clone(), 2);
    let id = orch.create_instance("web", "alice").unwrap();

    let (tx, rx) = watch::channel(false);
    let runner = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.run(rx).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = orch.delete_instance(&id).unwrap();
    assert!(status.in_flight);
    assert_eq!(status.pending, vec!["deprovision"]);

    wait_for(&orch, std::slice::from_ref(&id), InstanceState::Deleted).await;
    tx.send(true).unwrap();
    runner.await.unwrap();

    let stats = driver.stats();
    assert_eq!(stats.provision_calls, 1);
    assert_eq!(stats.deprovision_calls, 1);
    assert_eq!(stats.overlapping_calls, 0);
    assert!(!driver.has_resource(&id));
}
