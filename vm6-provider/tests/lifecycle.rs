//! End-to-end resource lifecycles through the provider.

mod common;

use std::time::Duration;

use common::TestProvider;
use vm6_provider::model::{AccountDesired, AccountRole, SecondaryDisk, SshKeySpec, VmDesired};
use vm6_provider::remote::RemoteApi;
use vm6_provider::{Desired, Error, Observed, RemoteError, ResourceKind, Tracked};

// =============================================================================
// VM
// =============================================================================

#[tokio::test]
async fn test_vm_lifecycle() {
    let t = TestProvider::new(4);

    let mut tracked = t.provider.create(&Desired::Vm(common::vm("db1"))).await.unwrap();
    assert_eq!(tracked.kind, ResourceKind::Qemu);
    assert_eq!(tracked.id.as_deref(), Some("node1/qemu/101"));

    let Some(Observed::Vm(observed)) = t.provider.read("node1/qemu/101").await.unwrap() else {
        panic!("expected a VM");
    };
    assert_eq!(observed.name, "db1");
    assert_eq!(observed.cores, 2);
    assert_eq!(observed.memory, 2048);
    assert_eq!(observed.disk, 20000);
    assert_eq!(observed.os, 5);
    assert_eq!(observed.node, 1);

    t.remote.take_calls().await;
    let desired = VmDesired {
        cores: 4,
        ..common::vm("db1")
    };
    t.provider
        .update(&mut tracked, &Desired::Vm(desired))
        .await
        .unwrap();
    assert_eq!(
        t.remote.take_calls().await,
        vec!["get_vm", "update_vm_resources", "get_vm"]
    );
    let Some(Observed::Vm(updated)) = &tracked.observed else {
        panic!("expected a VM");
    };
    assert_eq!(updated.cores, 4);
    assert!(updated.password.as_ref().unwrap().matches("secret"));

    t.provider.delete(&mut tracked).await.unwrap();
    assert!(tracked.is_gone());
    assert!(t.provider.read("node1/qemu/101").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_is_idempotent_by_name() {
    let t = TestProvider::new(4);

    let first = t.provider.create(&Desired::Vm(common::vm("db1"))).await.unwrap();
    let second = t.provider.create(&Desired::Vm(common::vm("db1"))).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(t.remote.call_count("create_vm").await, 1);
}

#[tokio::test]
async fn test_shrinking_disk_issues_no_remote_calls() {
    let t = TestProvider::new(4);
    let mut tracked = t.provider.create(&Desired::Vm(common::vm("db1"))).await.unwrap();
    t.remote.take_calls().await;

    let desired = VmDesired {
        disk: 10000,
        ..common::vm("db1")
    };
    let err = t
        .provider
        .update(&mut tracked, &Desired::Vm(desired))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::UnsupportedTransition {
            kind: ResourceKind::Qemu,
            attribute: "disk",
            ..
        }
    ));
    assert!(t.remote.calls().await.is_empty());
    assert_eq!(tracked.id.as_deref(), Some("node1/qemu/101"));
}

#[tokio::test]
async fn test_refresh_clears_id_of_vanished_resource() {
    let t = TestProvider::new(4);
    let mut tracked = t.provider.create(&Desired::Vm(common::vm("db1"))).await.unwrap();

    t.remote.delete_vm(101).await.unwrap();
    t.provider.refresh(&mut tracked).await.unwrap();

    assert!(tracked.is_gone());
    assert!(tracked.observed.is_none());
}

#[tokio::test]
async fn test_refresh_keeps_write_only_attributes() {
    let t = TestProvider::new(4);
    let mut tracked = t.provider.create(&Desired::Vm(common::vm("db1"))).await.unwrap();

    t.provider.refresh(&mut tracked).await.unwrap();

    let Some(Observed::Vm(observed)) = &tracked.observed else {
        panic!("expected a VM");
    };
    assert!(observed.password.as_ref().unwrap().matches("secret"));
    assert!(observed.provisioning.is_some());
}

#[tokio::test]
async fn test_persisted_state_keeps_password_unchanged() {
    let t = TestProvider::new(4);
    let tracked = t.provider.create(&Desired::Vm(common::vm("db1"))).await.unwrap();

    let stored = serde_json::to_string(&tracked).unwrap();
    assert!(!stored.contains("\"secret\""));
    let mut tracked: Tracked = serde_json::from_str(&stored).unwrap();
    t.remote.take_calls().await;

    t.provider
        .update(&mut tracked, &Desired::Vm(common::vm("db1")))
        .await
        .unwrap();
    assert_eq!(t.remote.take_calls().await, vec!["get_vm", "get_vm"]);

    let rotated = VmDesired {
        password: "rotated".into(),
        ..common::vm("db1")
    };
    t.provider
        .update(&mut tracked, &Desired::Vm(rotated))
        .await
        .unwrap();
    assert_eq!(
        t.remote.take_calls().await,
        vec!["get_vm", "change_vm_password", "get_vm"]
    );
    assert_eq!(t.remote.vm_password(101).await.as_deref(), Some("rotated"));
}

#[tokio::test]
async fn test_partial_create_is_reported() {
    let t = TestProvider::new(4);
    let mut desired = common::vm("db1");
    desired.provisioning.disks = vec![SecondaryDisk {
        size_mib: 1000,
        boot_order: 2,
        tags: vec![],
    }];
    t.remote
        .fail_call("attach_disk", 0, RemoteError::Transport("connection reset".into()))
        .await;

    let err = t.provider.create(&Desired::Vm(desired)).await.unwrap_err();
    match err {
        Error::PartialCreate { id, applied, pending, .. } => {
            assert_eq!(id, "node1/qemu/101");
            assert!(applied.is_empty());
            assert_eq!(pending.len(), 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The primary resource exists and can be imported.
    let tracked = t.provider.import("node1/qemu/101").await.unwrap();
    assert_eq!(tracked.kind, ResourceKind::Qemu);
    assert_eq!(t.provider.throttle().in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_remote_call_times_out() {
    let t = TestProvider::with_timeout(2, Duration::from_secs(10));
    t.remote.close_gate();

    let err = t.provider.read("node1/qemu/101").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Remote(RemoteError::Timeout { call: "get_vm", .. })
    ));
    assert_eq!(t.provider.throttle().in_flight(), 0);
}

#[tokio::test]
async fn test_malformed_identifiers() {
    let t = TestProvider::new(4);
    for id in ["", "node1//101", "node1/qemu/-1", "node1/disk/101", "a/b/c/d", "qemu/101"] {
        assert!(
            matches!(
                t.provider.read(id).await,
                Err(Error::MalformedIdentifier { .. })
            ),
            "{id:?} should be rejected"
        );
    }
    assert!(t.remote.calls().await.is_empty());
}

// =============================================================================
// Cluster-scoped kinds
// =============================================================================

#[tokio::test]
async fn test_network_lifecycle() {
    let t = TestProvider::new(4);
    let mut tracked = t
        .provider
        .create(&common::network("10.0.0.0/24", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(tracked.id.as_deref(), Some("network/1"));

    let err = t
        .provider
        .update(&mut tracked, &common::network("10.0.0.0/24", "10.0.0.254"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedTransition { attribute: "gateway", .. }
    ));

    t.provider.delete(&mut tracked).await.unwrap();
    assert!(t.provider.read("network/1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_pool_ranges_converge() {
    let t = TestProvider::new(4);
    let mut tracked = t
        .provider
        .create(&Desired::Pool(common::pool("public", &["A", "B", "C"])))
        .await
        .unwrap();
    t.remote.take_calls().await;

    t.provider
        .update(
            &mut tracked,
            &Desired::Pool(common::pool("public", &["B", "C", "D"])),
        )
        .await
        .unwrap();

    assert_eq!(
        t.remote.calls().await,
        vec!["get_pool", "delete_pool_range", "create_pool_range", "get_pool"]
    );
    let Some(Observed::Pool(pool)) = &tracked.observed else {
        panic!("expected a pool");
    };
    let ranges: Vec<&str> = pool.ranges.iter().map(|r| r.range.as_str()).collect();
    assert_eq!(ranges, vec!["B", "C", "D"]);
}

#[tokio::test]
async fn test_pool_update_retry_converges() {
    let t = TestProvider::new(4);
    let mut tracked = t
        .provider
        .create(&Desired::Pool(common::pool("public", &["A", "B", "C"])))
        .await
        .unwrap();
    t.remote
        .fail_call("create_pool_range", 0, RemoteError::Transport("reset".into()))
        .await;
    t.remote.take_calls().await;

    let desired = Desired::Pool(common::pool("public", &["B", "C", "D"]));
    let err = t.provider.update(&mut tracked, &desired).await.unwrap_err();
    assert!(matches!(err, Error::Remote(RemoteError::Transport(_))));
    assert_eq!(
        t.remote.take_calls().await,
        vec!["get_pool", "delete_pool_range", "create_pool_range"]
    );
    assert!(!tracked.is_gone());

    t.remote.clear_failures().await;
    t.provider.update(&mut tracked, &desired).await.unwrap();
    assert_eq!(
        t.remote.take_calls().await,
        vec!["get_pool", "create_pool_range", "get_pool"]
    );
    let Some(Observed::Pool(pool)) = &tracked.observed else {
        panic!("expected a pool");
    };
    let ranges: Vec<&str> = pool.ranges.iter().map(|r| r.range.as_str()).collect();
    assert_eq!(ranges, vec!["B", "C", "D"]);
}

#[tokio::test]
async fn test_account_import_and_role_change() {
    let t = TestProvider::new(4);
    let desired = AccountDesired {
        email: "ops@example.com".into(),
        role: AccountRole::User,
        password: "pw".into(),
        ssh_keys: vec![SshKeySpec {
            name: "laptop".into(),
            ssh_pub_key: "ssh-ed25519 AAAA".into(),
        }],
    };
    let created = t
        .provider
        .create(&Desired::Account(desired.clone()))
        .await
        .unwrap();
    let id = created.id.unwrap();

    let mut imported = t.provider.import(&id).await.unwrap();
    assert_eq!(imported.kind, ResourceKind::Account);

    t.provider
        .update(
            &mut imported,
            &Desired::Account(AccountDesired {
                role: AccountRole::Admin,
                ..desired
            }),
        )
        .await
        .unwrap();
    let Some(Observed::Account(account)) = &imported.observed else {
        panic!("expected an account");
    };
    assert_eq!(account.role, AccountRole::Admin);
    assert_eq!(account.ssh_keys.len(), 1);
}

#[tokio::test]
async fn test_update_of_vanished_resource_forgets_it() {
    let t = TestProvider::new(4);
    let mut tracked = t
        .provider
        .create(&Desired::Pool(common::pool("public", &["A"])))
        .await
        .unwrap();
    t.remote.delete_pool("1").await.unwrap();

    t.provider
        .update(&mut tracked, &Desired::Pool(common::pool("renamed", &["A"])))
        .await
        .unwrap();
    assert!(tracked.is_gone());
}
