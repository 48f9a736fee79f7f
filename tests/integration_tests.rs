mod common;

use common::{TestCluster, SETTLE_TIMEOUT};
use shardstore::{RawCommand, Role, StoreError};
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread")]
async fn test_write_is_visible_on_every_replica() {
    let cluster = TestCluster::start(3, &["shop"]).await;

    cluster
        .submit("shop", RawCommand::structured("CREATE TABLE items (name TEXT)"))
        .await;
    let report = cluster
        .submit(
            "shop",
            RawCommand::directive("USE shop; INSERT INTO items VALUES ('pen'); INSERT INTO items VALUES ('ink');"),
        )
        .await;
    assert!(report.errors.is_empty());

    for id in cluster.running() {
        cluster
            .wait_for_rows(id, "shop", "SELECT name FROM items ORDER BY name", &["ink", "pen"])
            .await;
        let audit = cluster.node(id).manager.applied_commands("shop").unwrap();
        let sqls: Vec<_> = audit.iter().map(|c| c.sql.as_str()).collect();
        assert_eq!(
            sqls,
            vec![
                "CREATE TABLE items (name TEXT)",
                "INSERT INTO items VALUES ('pen')",
                "INSERT INTO items VALUES ('ink')"
            ]
        );
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_rejects_submissions() {
    let cluster = TestCluster::start(3, &["shop"]).await;
    let leader = cluster.wait_for_leader("shop").await;
    let follower = cluster
        .running()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();

    let result = cluster
        .node(follower)
        .manager
        .submit("shop", RawCommand::structured("CREATE TABLE never (id INT)"))
        .await;
    assert!(matches!(result, Err(StoreError::NotLeader)));

    cluster
        .submit("shop", RawCommand::structured("CREATE TABLE later (id INT)"))
        .await;
    for id in cluster.running() {
        cluster
            .wait_for_rows(
                id,
                "shop",
                "SELECT name FROM sqlite_master WHERE name IN ('never', 'later')",
                &["later"],
            )
            .await;
        let audit = cluster.node(id).manager.applied_commands("shop").unwrap();
        assert!(audit.iter().all(|c| !c.sql.contains("never")));
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_groups_do_not_interfere() {
    let cluster = TestCluster::start(3, &["shop", "billing"]).await;

    cluster
        .submit("shop", RawCommand::structured("CREATE TABLE items (name TEXT)"))
        .await;
    cluster
        .submit("billing", RawCommand::structured("CREATE TABLE invoices (total INT)"))
        .await;
    cluster
        .submit("billing", RawCommand::structured("INSERT INTO invoices VALUES (12)"))
        .await;
    // A directive naming another database is recorded, not executed.
    let report = cluster
        .submit("shop", RawCommand::directive("USE billing; DELETE FROM invoices;"))
        .await;
    assert_eq!(report.errors.len(), 1);

    for id in cluster.running() {
        cluster
            .wait_for_rows(id, "billing", "SELECT total FROM invoices", &["12"])
            .await;
        cluster
            .wait_for_rows(id, "shop", "SELECT COUNT(*) FROM items", &["0"])
            .await;
        assert!(cluster.rows(id, "shop", "SELECT * FROM invoices").is_err());
        assert!(cluster.rows(id, "billing", "SELECT * FROM items").is_err());
        let billing = cluster.node(id).manager.applied_commands("billing").unwrap();
        assert_eq!(billing.len(), 2);
    }

    let statuses = cluster.node(1).manager.statuses();
    let groups: Vec<_> = statuses.iter().map(|s| s.group.as_str()).collect();
    assert_eq!(groups, vec!["billing", "shop"]);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_group_is_reported() {
    let cluster = TestCluster::start(3, &["shop"]).await;
    let manager = &cluster.node(1).manager;

    assert!(matches!(
        manager
            .submit("inventory", RawCommand::structured("SELECT 1"))
            .await,
        Err(StoreError::GroupNotFound(_))
    ));
    assert!(matches!(
        manager.query("inventory", "SELECT 1"),
        Err(StoreError::GroupNotFound(_))
    ));
    assert!(matches!(
        manager.status("inventory"),
        Err(StoreError::GroupNotFound(_))
    ));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_failover() {
    let mut cluster = TestCluster::start(3, &["shop"]).await;

    cluster
        .submit("shop", RawCommand::structured("CREATE TABLE items (name TEXT)"))
        .await;
    cluster
        .submit("shop", RawCommand::structured("INSERT INTO items VALUES ('pen')"))
        .await;
    let old_leader = cluster.wait_for_leader("shop").await;
    cluster.stop(old_leader).await;

    let new_leader = cluster.wait_for_leader("shop").await;
    assert_ne!(new_leader, old_leader);
    cluster
        .submit("shop", RawCommand::structured("INSERT INTO items VALUES ('ink')"))
        .await;

    for id in cluster.running() {
        cluster
            .wait_for_rows(id, "shop", "SELECT name FROM items ORDER BY name", &["ink", "pen"])
            .await;
    }
    let status = cluster.node(new_leader).manager.status("shop").unwrap();
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.leader_id, Some(new_leader));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restarted_follower_applies_each_command_once() {
    let mut cluster = TestCluster::start(3, &["shop"]).await;

    cluster
        .submit("shop", RawCommand::structured("CREATE TABLE counter (n INT)"))
        .await;
    cluster
        .submit("shop", RawCommand::structured("INSERT INTO counter VALUES (1)"))
        .await;
    let leader = cluster.wait_for_leader("shop").await;
    let follower = cluster
        .running()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();
    cluster
        .wait_for_rows(follower, "shop", "SELECT COUNT(*) FROM counter", &["1"])
        .await;

    cluster.stop(follower).await;
    cluster
        .submit("shop", RawCommand::structured("INSERT INTO counter VALUES (2)"))
        .await;
    cluster.restart(follower).await;

    cluster
        .wait_for_rows(follower, "shop", "SELECT n FROM counter ORDER BY n", &["1", "2"])
        .await;
    let audit = cluster.node(follower).manager.applied_commands("shop").unwrap();
    let ids: HashSet<_> = audit.iter().map(|c| c.command_id).collect();
    assert_eq!(ids.len(), audit.len());
    assert_eq!(audit.len(), 3);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let mut cluster = TestCluster::start_with(3, &["shop"], |config| config.snapshot_delta = 4).await;

    cluster
        .submit("shop", RawCommand::structured("CREATE TABLE counter (n INT)"))
        .await;
    let leader = cluster.wait_for_leader("shop").await;
    let follower = cluster
        .running()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();
    cluster
        .wait_for_rows(follower, "shop", "SELECT COUNT(*) FROM counter", &["0"])
        .await;

    cluster.stop(follower).await;
    for n in 1..=10 {
        cluster
            .submit("shop", RawCommand::structured(&format!("INSERT INTO counter VALUES ({})", n)))
            .await;
    }
    let leader = cluster.wait_for_leader("shop").await;
    assert!(cluster
        .group_dir(leader, "shop")
        .join("snapshots")
        .join("snapshot.bin")
        .exists());
    cluster.restart(follower).await;

    cluster
        .wait_for_rows(follower, "shop", "SELECT SUM(n) FROM counter", &["55"])
        .await;
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let sql = |id: usize| -> Vec<String> {
            cluster
                .node(id)
                .manager
                .applied_commands("shop")
                .unwrap()
                .into_iter()
                .map(|c| c.sql)
                .collect()
        };
        let (expected, actual) = (sql(leader), sql(follower));
        if expected == actual {
            assert_eq!(actual.len(), 11);
            break;
        }
        assert!(Instant::now() < deadline, "audit never converged: {:?} vs {:?}", expected, actual);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_health() {
    let cluster = TestCluster::start(3, &["shop"]).await;
    let leader = cluster.wait_for_leader("shop").await;
    for id in cluster.running() {
        let manager = &cluster.node(id).manager;
        manager
            .wait_for_leader("shop", Duration::from_secs(20))
            .await
            .unwrap();
        let status = manager.status("shop").unwrap();
        if id == leader {
            assert!(manager.all_leaders_healthy());
            assert_eq!(status.leader_addr, Some(manager.listen_addr()));
        } else {
            assert!(!manager.all_leaders_healthy());
            assert_eq!(status.role, Role::Follower);
            assert_eq!(status.leader_id, Some(leader));
        }
    }
    cluster.shutdown().await;
}
