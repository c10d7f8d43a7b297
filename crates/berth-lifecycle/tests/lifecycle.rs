//! Instance lifecycle scenarios, driven task by task on a paused clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::{BerthConfig, SizeClass};
use berth_driver::drivers::DummyDriver;
use berth_driver::testing::LedgerDriver;
use berth_driver::{BackendStatus, Driver, DriverError, DriverRegistry, StaticCredentialStore};
use berth_lifecycle::{LifecycleError, ManualClock, Orchestrator};
use berth_state::{Blueprint, InstanceState, StateStore};

struct Harness {
    orch: Orchestrator,
    store: StateStore,
    clock: Arc<ManualClock>,
}

fn harness(driver: Arc<dyn Driver>, config: BerthConfig) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let registry = DriverRegistry::new().with(driver.name(), driver);
    let orch = Orchestrator::builder(
        config,
        store.clone(),
        registry,
        Arc::new(StaticCredentialStore::new()),
    )
    .clock(clock.clone())
    .build()
    .unwrap();
    Harness { orch, store, clock }
}

fn blueprint(store: &StateStore, id: &str, driver: &str, max_lifetime: Option<u64>) {
    store
        .put_blueprint(&Blueprint {
            id: id.into(),
            name: format!("{id} workload"),
            driver: driver.into(),
            size_class: SizeClass::Small,
            image: "registry.local/workload:1".into(),
            enabled: true,
            max_lifetime,
            config: BTreeMap::new(),
        })
        .unwrap();
}

fn dummy(config: BerthConfig) -> (Harness, Arc<DummyDriver>) {
    let driver = Arc::new(DummyDriver::new());
    let h = harness(driver.clone(), config);
    blueprint(&h.store, "web", "dummy", None);
    (h, driver)
}

#[tokio::test(start_paused = true)]
async fn dummy_instance_reaches_running_without_retries() {
    let (h, driver) = dummy(BerthConfig::default());

    let id = h.orch.create_instance("web", "alice").unwrap();
    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Requested);
    assert_eq!(status.pending, vec!["provision"]);
    assert!(status.name.starts_with("pb-"));

    assert_eq!(h.orch.run_pending().await, 1);

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(status.attempts, 1);
    assert_eq!(status.last_error, None);
    assert!(status.pending.is_empty());
    assert_eq!(driver.stats().provision_calls, 1);

    let logs = h.orch.get_instance_logs(&id).unwrap();
    assert!(logs.iter().any(|l| l.message.ends_with("is running")));
}

#[tokio::test(start_paused = true)]
async fn deleting_a_requested_instance_never_provisions() {
    let (h, driver) = dummy(BerthConfig::default());

    let id = h.orch.create_instance("web", "alice").unwrap();
    let status = h.orch.delete_instance(&id).unwrap();
    assert!(status.deletion_requested);
    assert_eq!(status.pending, vec!["deprovision"]);

    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Deleted);
    let stats = driver.stats();
    assert_eq!(stats.provision_calls, 0);
    assert_eq!(stats.deprovision_calls, 0);
    assert_eq!(h.orch.engine().queue().stats().cancelled, 1);
    assert!(h.orch.list_instances(false).unwrap().is_empty());
    assert_eq!(h.orch.list_instances(true).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_instance_fails_and_respawns_once() {
    let (h, driver) = dummy(BerthConfig::default());
    let id = h.orch.create_instance("web", "alice").unwrap();
    h.orch.run_pending().await;

    driver.set_status(&id, BackendStatus::Unreachable);
    assert_eq!(h.orch.sweep().unwrap().probes, 1);
    h.orch.run_pending().await;
    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Running
    );

    // Past the three minute grace window.
    h.clock.advance(200);
    h.orch.sweep().unwrap();
    h.orch.run_pending().await;

    // Respawned and provisioned again; the backend still answers
    // unreachable, so it waits in provisioning.
    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Provisioning);
    assert_eq!(status.respawn_count, 1);
    assert_eq!(driver.stats().provision_calls, 2);
    assert_eq!(driver.stats().deprovision_calls, 1);

    driver.clear_status(&id);
    tokio::time::advance(Duration::from_secs(5)).await;
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(status.respawn_count, 1);

    // Healthy from here on: no further respawns.
    h.clock.advance(600);
    h.orch.sweep().unwrap();
    h.orch.run_pending().await;
    assert_eq!(h.orch.get_instance_status(&id).unwrap().respawn_count, 1);
    assert_eq!(driver.stats().provision_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn respawn_budget_exhaustion_needs_an_operator() {
    let mut config = BerthConfig::default();
    config.engine.respawn_limit = 0;
    let (h, driver) = dummy(config);
    let id = h.orch.create_instance("web", "alice").unwrap();
    h.orch.run_pending().await;

    driver.set_status(&id, BackendStatus::NotFound);
    h.orch.sweep().unwrap();
    h.orch.run_pending().await;
    h.clock.advance(181);
    h.orch.sweep().unwrap();
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Failed);
    assert_eq!(status.respawn_count, 0);
    assert!(status.pending.is_empty());
    // Cleaned up right away since nothing will reuse the resource.
    assert_eq!(driver.stats().deprovision_calls, 1);

    driver.clear_status(&id);
    let status = h.orch.retry_instance(&id).unwrap();
    // The engine moves the record once the task runs.
    assert_eq!(status.state, InstanceState::Failed);
    assert_eq!(status.pending, vec!["retry"]);
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(status.respawn_count, 0);
    assert_eq!(status.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn stuck_provisioning_is_failed_and_retried() {
    let (h, driver) = dummy(BerthConfig::default());
    let id = h.orch.create_instance("web", "alice").unwrap();
    let first_name = h.orch.get_instance_status(&id).unwrap().name;
    // The backend never reports the instance as up.
    driver.set_status(&id, BackendStatus::Pending);
    h.orch.run_pending().await;
    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Provisioning
    );

    h.clock.advance(15 * 60);
    assert_eq!(h.orch.sweep().unwrap().stuck, 1);
    tokio::time::advance(Duration::from_secs(5)).await;
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Failed);
    assert!(
        status
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("stuck in provisioning for 900s")
    );
    assert_eq!(status.pending, vec!["check_status", "respawn"]);

    driver.clear_status(&id);
    tokio::time::advance(Duration::from_secs(10)).await;
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(status.respawn_count, 1);
    // Same backend name on every attempt.
    assert_eq!(status.name, first_name);
    assert_eq!(driver.stats().provision_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_fail_without_retry() {
    let (h, driver) = dummy(BerthConfig::default());
    driver.fail_next_provision(DriverError::Permanent("quota exceeded".into()));
    let id = h.orch.create_instance("web", "alice").unwrap();

    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Failed);
    assert_eq!(status.last_error.as_deref(), Some("permanent: quota exceeded"));
    assert!(status.pending.is_empty());
    assert_eq!(driver.stats().provision_calls, 1);
    assert_eq!(driver.stats().deprovision_calls, 1);

    h.orch.delete_instance(&id).unwrap();
    h.orch.run_pending().await;
    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Deleted
    );
}

#[tokio::test(start_paused = true)]
async fn transient_errors_retry_within_the_budget() {
    let (h, driver) = dummy(BerthConfig::default());
    driver.fail_next_provision(DriverError::Transient("rate limited".into()));
    driver.fail_next_provision(DriverError::Timeout("took too long".into()));
    let id = h.orch.create_instance("web", "alice").unwrap();

    h.orch.run_pending().await;
    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Retrying
    );
    tokio::time::advance(Duration::from_secs(5)).await;
    h.orch.run_pending().await;
    tokio::time::advance(Duration::from_secs(10)).await;
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(status.attempts, 3);
    assert_eq!(status.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn failed_deletion_is_retried_until_it_succeeds() {
    let (h, driver) = dummy(BerthConfig::default());
    let id = h.orch.create_instance("web", "alice").unwrap();
    h.orch.run_pending().await;

    driver.fail_next_deprovision(DriverError::Transient("api timeout".into()));
    driver.fail_next_deprovision(DriverError::Permanent("api refused".into()));
    h.orch.delete_instance(&id).unwrap();

    h.orch.run_pending().await;
    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Deprovisioning
    );

    tokio::time::advance(Duration::from_secs(5)).await;
    h.orch.run_pending().await;
    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Failed);
    assert_eq!(
        status.last_error.as_deref(),
        Some("deprovision failed: permanent: api refused")
    );
    assert_eq!(status.pending, vec!["deprovision"]);

    tokio::time::advance(Duration::from_secs(300)).await;
    h.orch.run_pending().await;
    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Deleted
    );
    assert!(!driver.has_resource(&id));
    assert_eq!(driver.stats().deprovision_calls, 3);
}

#[tokio::test(start_paused = true)]
async fn reusing_driver_does_not_leak_across_retries() {
    let ledger = Arc::new(LedgerDriver::reusing());
    ledger.fail_after_allocate(2);
    let h = harness(ledger.clone(), BerthConfig::default());
    blueprint(&h.store, "db", "ledger", None);
    let id = h.orch.create_instance("db", "alice").unwrap();

    h.orch.run_pending().await;
    tokio::time::advance(Duration::from_secs(5)).await;
    h.orch.run_pending().await;
    tokio::time::advance(Duration::from_secs(10)).await;
    h.orch.run_pending().await;

    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Running
    );
    assert_eq!(ledger.allocations(), 1);
    assert_eq!(ledger.live_resources(), 1);

    h.orch.delete_instance(&id).unwrap();
    h.orch.run_pending().await;
    assert_eq!(ledger.live_resources(), 0);
    assert_eq!(ledger.releases(), 1);
    assert!(ledger.violations().is_empty(), "{:?}", ledger.violations());
}

#[tokio::test(start_paused = true)]
async fn operator_retry_cleans_up_before_provisioning_again() {
    let ledger = Arc::new(LedgerDriver::non_reusing());
    ledger.fail_after_allocate(1);
    let mut config = BerthConfig::default();
    config.engine.provision_retry_budget = 1;
    let h = harness(ledger.clone(), config);
    blueprint(&h.store, "db", "ledger", None);
    let id = h.orch.create_instance("db", "alice").unwrap();

    h.orch.run_pending().await;
    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Failed);
    assert!(status.last_error.unwrap().starts_with("gave up after 1 attempts"));
    assert_eq!(ledger.live_resources(), 0);

    h.orch.retry_instance(&id).unwrap();
    h.orch.run_pending().await;

    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Running
    );
    assert_eq!(ledger.allocations(), 2);
    assert_eq!(ledger.live_resources(), 1);
    assert!(ledger.violations().is_empty(), "{:?}", ledger.violations());
}

#[tokio::test(start_paused = true)]
async fn refused_cleanup_keeps_a_retried_instance_failed() {
    let (h, driver) = dummy(BerthConfig::default());
    driver.fail_next_provision(DriverError::Permanent("bad image".into()));
    let id = h.orch.create_instance("web", "alice").unwrap();
    h.orch.run_pending().await;
    assert_eq!(
        h.orch.get_instance_status(&id).unwrap().state,
        InstanceState::Failed
    );

    driver.fail_next_deprovision(DriverError::Permanent("backend refused".into()));
    h.orch.retry_instance(&id).unwrap();
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Failed);
    assert_eq!(
        status.last_error.as_deref(),
        Some("cleanup before respawn failed: permanent: backend refused")
    );

    // A later sweep must not provision over the leftover resource.
    assert_eq!(h.orch.sweep().unwrap().recovered, 0);
    h.orch.run_pending().await;
    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Failed);
    assert_eq!(driver.stats().provision_calls, 1);

    // Once the backend cooperates, the next retry goes through.
    h.orch.retry_instance(&id).unwrap();
    h.orch.run_pending().await;
    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(status.respawn_count, 0);
    assert_eq!(driver.stats().provision_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_without_driver_support_keeps_running() {
    let ledger = Arc::new(LedgerDriver::reusing());
    let h = harness(ledger.clone(), BerthConfig::default());
    blueprint(&h.store, "db", "ledger", None);
    let id = h.orch.create_instance("db", "alice").unwrap();
    h.orch.run_pending().await;

    let params = BTreeMap::from([("memory".to_string(), "4g".to_string())]);
    h.orch.reconfigure_instance(&id, params).unwrap();
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(
        status.last_error.as_deref(),
        Some("reconfigure unsupported: ledger driver does not support reconfigure")
    );
}

#[tokio::test(start_paused = true)]
async fn reconfigure_merges_driver_metadata() {
    let (h, driver) = dummy(BerthConfig::default());
    let id = h.orch.create_instance("web", "alice").unwrap();

    let params = BTreeMap::from([("replicas".to_string(), "3".to_string())]);
    let err = h.orch.reconfigure_instance(&id, params.clone()).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidState { action: "reconfigure", .. }
    ));

    h.orch.run_pending().await;
    h.orch.reconfigure_instance(&id, params).unwrap();
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(status.metadata.get("config.replicas").map(String::as_str), Some("3"));
    assert_eq!(driver.stats().reconfigure_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn max_lifetime_deletes_the_instance() {
    let driver = Arc::new(DummyDriver::new());
    let h = harness(driver.clone(), BerthConfig::default());
    blueprint(&h.store, "ephemeral", "dummy", Some(3_600));
    let id = h.orch.create_instance("ephemeral", "alice").unwrap();
    h.orch.run_pending().await;

    h.clock.advance(1_800);
    assert_eq!(h.orch.sweep().unwrap().expired, 0);
    h.clock.advance(1_800);
    assert_eq!(h.orch.sweep().unwrap().expired, 1);
    h.orch.run_pending().await;

    let status = h.orch.get_instance_status(&id).unwrap();
    assert_eq!(status.state, InstanceState::Deleted);
    assert!(!driver.has_resource(&id));
}

#[tokio::test(start_paused = true)]
async fn create_rejects_unusable_blueprints() {
    let (h, _driver) = dummy(BerthConfig::default());
    blueprint(&h.store, "vm", "openstack", None);
    let mut disabled = h.store.get_blueprint("web").unwrap().unwrap();
    disabled.id = "old".into();
    disabled.enabled = false;
    h.store.put_blueprint(&disabled).unwrap();

    assert!(matches!(
        h.orch.create_instance("nope", "alice"),
        Err(LifecycleError::BlueprintNotFound(_))
    ));
    assert!(matches!(
        h.orch.create_instance("old", "alice"),
        Err(LifecycleError::BlueprintDisabled(_))
    ));
    assert!(matches!(
        h.orch.create_instance("vm", "alice"),
        Err(LifecycleError::DriverNotEnabled { .. })
    ));
    assert!(h.orch.list_instances(true).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn operator_calls_check_state() {
    let (h, _driver) = dummy(BerthConfig::default());
    let id = h.orch.create_instance("web", "alice").unwrap();
    h.orch.run_pending().await;

    assert!(matches!(
        h.orch.retry_instance(&id),
        Err(LifecycleError::InvalidState { action: "retry", state: InstanceState::Running, .. })
    ));
    assert!(matches!(
        h.orch.get_instance_status("inst-missing"),
        Err(LifecycleError::InstanceNotFound(_))
    ));
    assert!(matches!(
        h.orch.get_instance_logs("inst-missing"),
        Err(LifecycleError::InstanceNotFound(_))
    ));
    assert!(h.orch.pool_snapshot().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn startup_sweep_recovers_work_from_a_previous_run() {
    let (h, driver) = dummy(BerthConfig::default());
    let id = h.orch.create_instance("web", "alice").unwrap();

    // A second engine on the same store, as after a restart: the queue is
    // empty but the record still waits for provisioning.
    let restarted = Orchestrator::builder(
        BerthConfig::default(),
        h.store.clone(),
        DriverRegistry::new().with("dummy", driver.clone()),
        Arc::new(StaticCredentialStore::new()),
    )
    .clock(h.clock.clone())
    .build()
    .unwrap();

    assert_eq!(restarted.sweep().unwrap().recovered, 1);
    restarted.run_pending().await;
    assert_eq!(
        restarted.get_instance_status(&id).unwrap().state,
        InstanceState::Running
    );
}
