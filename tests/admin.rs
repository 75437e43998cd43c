//! Pool and admin surfaces against a scripted fleet

mod common;

use bson::{doc, Bson};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use common::fixture;
use mongo_fleet::admin::{DatabaseAdmin, Inspection, ServerAdmin, UserAdmin};
use mongo_fleet::db::schemas::{DatabaseDoc, ProvisionDoc, ServerDoc, UserDoc};
use mongo_fleet::store::EntityStore;
use mongo_fleet::FleetError;

#[tokio::test]
async fn test_concurrent_clients_share_one_connect() {
    let fx = fixture().await;
    let server = fx.servers[0].clone();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = fx.pool.clone();
        let store = fx.store.clone();
        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            pool.client_for(store.as_ref(), &server).await
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(fx.fleet.connects(), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(fx.pool.len(), 1);
}

#[tokio::test]
async fn test_connect_all_skips_disabled_and_unreachable() {
    let fx = fixture().await;
    fx.fleet.set_unreachable(&fx.address(2));
    let disabled = fx
        .store
        .update::<ServerDoc>(&fx.server_id(0), doc! { "$set": { "enabled": false } })
        .await
        .unwrap();

    let servers = vec![disabled, fx.servers[1].clone(), fx.servers[2].clone()];
    assert_eq!(fx.pool.connect_all(fx.store.as_ref(), &servers).await, 1);
    assert!(fx.pool.contains(&fx.server_id(1)));
    assert!(!fx.pool.contains(&fx.server_id(0)));
    assert!(!fx.pool.contains(&fx.server_id(2)));

    let stats = fx.pool.stats();
    assert_eq!(stats.connected, 1);
    assert_eq!(stats.clients[0].server_name, "db-1");

    assert_eq!(fx.pool.shutdown().await, 1);
    assert!(fx.pool.is_empty());
}

#[tokio::test]
async fn test_server_enable_disable_lookup() {
    let fx = fixture().await;
    let admin = ServerAdmin::new(fx.store.clone(), fx.pool.clone());

    assert_ok!(admin.inspect(&fx.server_id(0), &Inspection::Status).await);
    assert!(fx.pool.contains(&fx.server_id(0)));

    let server = assert_ok!(admin.disable(&fx.server_id(0)).await);
    assert!(!server.enabled);
    assert!(!fx.pool.contains(&fx.server_id(0)));

    let err = assert_err!(admin.disable(&fx.server_id(0)).await);
    assert!(matches!(err, FleetError::Validation(_)));

    let found = assert_ok!(admin.lookup(Some("us-east-1")).await);
    assert_eq!(found._id, Some(fx.server_id(1)));
    let found = assert_ok!(admin.lookup(Some("ap-south-1")).await);
    assert_eq!(found._id, Some(fx.server_id(1)));

    assert!(assert_ok!(admin.enable(&fx.server_id(0)).await).enabled);
    assert_err!(admin.enable(&fx.server_id(0)).await);
}

#[tokio::test]
async fn test_lookup_with_every_server_disabled() {
    let fx = fixture().await;
    let admin = ServerAdmin::new(fx.store.clone(), fx.pool.clone());
    for i in 0..3 {
        admin.disable(&fx.server_id(i)).await.unwrap();
    }

    let err = assert_err!(admin.lookup(None).await);
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_drop_connection() {
    let fx = fixture().await;
    let admin = ServerAdmin::new(fx.store.clone(), fx.pool.clone());

    assert_ok!(admin.drop_connection(&fx.server_id(1), "db-0.internal", 27017).await);
    assert_eq!(fx.fleet.command_targets("dropConnections"), vec![fx.address(1)]);

    let err = assert_err!(admin.drop_connection(&fx.server_id(1), " ", 27017).await);
    assert!(matches!(err, FleetError::Validation(_)));
}

#[tokio::test]
async fn test_user_roles_follow_grants() {
    let fx = fixture().await;
    let id = fx.allocator.provision(None, None).await.unwrap();
    let provision: ProvisionDoc = fx.store.resolve(&id).await.unwrap();
    let admin = UserAdmin::new(fx.store.clone(), fx.topology.clone());

    let info = assert_ok!(admin.info(&provision.user).await);
    assert_eq!(info.len(), 1);

    let user = assert_ok!(admin.grant_roles(&provision.user, &["read".to_string()]).await);
    assert_eq!(user.roles, vec!["dbOwner", "read"]);
    assert_eq!(fx.fleet.user_roles("admin", &user.name).len(), 2);

    let user = assert_ok!(admin.revoke_roles(&provision.user, &["dbOwner".to_string()]).await);
    assert_eq!(user.roles, vec!["read"]);
    let remote = fx.fleet.user_roles("admin", &user.name);
    assert_eq!(remote.len(), 1);
    assert_eq!(
        remote[0],
        Bson::Document(doc! { "role": "read", "db": provision_db(&fx, &provision).await })
    );

    let err = assert_err!(admin.grant_roles(&provision.user, &[]).await);
    assert!(matches!(err, FleetError::Validation(_)));
}

async fn provision_db(fx: &common::Fixture<mongo_fleet::MemoryStore>, provision: &ProvisionDoc) -> String {
    let database: DatabaseDoc = fx.store.resolve(&provision.database).await.unwrap();
    database.name
}

#[tokio::test]
async fn test_user_ensure_and_drop() {
    let fx = fixture().await;
    let id = fx.allocator.provision(None, None).await.unwrap();
    let provision: ProvisionDoc = fx.store.resolve(&id).await.unwrap();
    let user: UserDoc = fx.store.resolve(&provision.user).await.unwrap();
    let admin = UserAdmin::new(fx.store.clone(), fx.topology.clone());

    assert_ok!(admin.ensure(&provision.user).await);
    assert_eq!(fx.fleet.command_count("updateUser"), 1);
    assert_eq!(fx.fleet.command_count("createUser"), 1);

    assert_eq!(assert_ok!(admin.drop(&provision.user).await), provision.user);
    assert!(!fx.fleet.has_user("admin", &user.name));
    assert!(fx.store.resolve::<UserDoc>(&provision.user).await.unwrap_err().is_not_found());

    assert!(admin.info(&provision.user).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_database_maintenance() {
    let fx = fixture().await;
    let id = fx.allocator.provision(None, None).await.unwrap();
    let provision: ProvisionDoc = fx.store.resolve(&id).await.unwrap();
    let admin = DatabaseAdmin::new(fx.store.clone(), fx.topology.clone());

    assert_ok!(admin.db_stats(&provision.database).await);
    assert_ok!(admin.coll_stats(&provision.database, "orders").await);
    assert_ok!(
        admin
            .create_index(&provision.database, "orders", doc! { "email": 1 }, None, true)
            .await
    );
    assert_ok!(admin.drop_index(&provision.database, "orders", "email_1").await);
    assert_eq!(fx.fleet.command_targets("createIndexes"), vec![fx.address(1)]);

    let err = assert_err!(admin.convert_to_capped(&provision.database, "orders", 0).await);
    assert!(matches!(err, FleetError::Validation(_)));
    let err = assert_err!(admin.create_index(&provision.database, "orders", doc! {}, None, false).await);
    assert!(matches!(err, FleetError::Validation(_)));
    assert_eq!(fx.fleet.command_count("convertToCapped"), 0);
}

/// Give the provisioned user a second database on the same primary
async fn add_second_database(fx: &common::Fixture<mongo_fleet::MemoryStore>, provision: &ProvisionDoc) -> DatabaseDoc {
    let second = fx
        .store
        .create(
            DatabaseDoc::new("reports")
                .on_server(fx.server_id(1))
                .in_replica_set(fx.replica_set_id()),
        )
        .await
        .unwrap();
    fx.store
        .update::<UserDoc>(&provision.user, doc! { "$addToSet": { "databases": second._id.unwrap() } })
        .await
        .unwrap();
    second
}

#[tokio::test]
async fn test_ensure_keeps_roles_on_every_database_of_a_server() {
    let fx = fixture().await;
    let id = fx.allocator.provision(None, None).await.unwrap();
    let provision: ProvisionDoc = fx.store.resolve(&id).await.unwrap();
    let first = provision_db(&fx, &provision).await;
    add_second_database(&fx, &provision).await;
    let admin = UserAdmin::new(fx.store.clone(), fx.topology.clone());

    let user = assert_ok!(admin.ensure(&provision.user).await);
    assert_eq!(fx.fleet.command_count("updateUser"), 1);

    let remote = fx.fleet.user_roles("admin", &user.name);
    assert_eq!(remote.len(), 2);
    assert!(remote.contains(&Bson::Document(doc! { "role": "dbOwner", "db": first })));
    assert!(remote.contains(&Bson::Document(doc! { "role": "dbOwner", "db": "reports" })));

    assert_ok!(admin.grant_roles(&provision.user, &["read".to_string()]).await);
    assert_eq!(fx.fleet.command_count("grantRolesToUser"), 1);
    assert_eq!(fx.fleet.user_roles("admin", &user.name).len(), 4);

    // Reads stay on the recorded server and visit it once
    assert_eq!(assert_ok!(admin.info(&provision.user).await).len(), 1);
}

#[tokio::test]
async fn test_user_writes_follow_the_current_primary() {
    let fx = fixture().await;
    let id = fx.allocator.provision(None, None).await.unwrap();
    let provision: ProvisionDoc = fx.store.resolve(&id).await.unwrap();
    let admin = UserAdmin::new(fx.store.clone(), fx.topology.clone());

    // The records still name db-1 as the database's server
    fx.fleet.set_primary(Some(&fx.address(2)));

    assert_ok!(admin.grant_roles(&provision.user, &["read".to_string()]).await);
    assert_eq!(fx.fleet.command_targets("grantRolesToUser"), vec![fx.address(2)]);

    assert_ok!(admin.ensure(&provision.user).await);
    assert_eq!(fx.fleet.command_targets("updateUser"), vec![fx.address(2)]);

    assert_ok!(admin.drop(&provision.user).await);
    assert_eq!(fx.fleet.command_targets("dropUser"), vec![fx.address(2)]);
}

#[tokio::test]
async fn test_user_writes_without_primary() {
    let fx = fixture().await;
    let id = fx.allocator.provision(None, None).await.unwrap();
    let provision: ProvisionDoc = fx.store.resolve(&id).await.unwrap();
    let admin = UserAdmin::new(fx.store.clone(), fx.topology.clone());
    fx.fleet.set_primary(None);

    let err = assert_err!(admin.grant_roles(&provision.user, &["read".to_string()]).await);
    assert!(matches!(err, FleetError::NoPrimary(_)));
    let user: UserDoc = fx.store.resolve(&provision.user).await.unwrap();
    assert_eq!(user.roles, vec!["dbOwner"]);

    // Inspection still answers from the recorded server
    assert_eq!(assert_ok!(admin.info(&provision.user).await).len(), 1);
}

#[tokio::test]
async fn test_database_writes_follow_the_current_primary() {
    let fx = fixture().await;
    let id = fx.allocator.provision(None, None).await.unwrap();
    let provision: ProvisionDoc = fx.store.resolve(&id).await.unwrap();
    let admin = DatabaseAdmin::new(fx.store.clone(), fx.topology.clone());
    fx.fleet.set_primary(Some(&fx.address(0)));

    assert_ok!(
        admin
            .create_index(&provision.database, "orders", doc! { "email": 1 }, None, false)
            .await
    );
    assert_ok!(admin.convert_to_capped(&provision.database, "logs", 4096).await);
    assert_ok!(admin.drop_index(&provision.database, "orders", "email_1").await);
    assert_eq!(fx.fleet.command_targets("createIndexes"), vec![fx.address(0)]);
    assert_eq!(fx.fleet.command_targets("convertToCapped"), vec![fx.address(0)]);
    assert_eq!(fx.fleet.command_targets("dropIndexes"), vec![fx.address(0)]);

    assert_ok!(admin.db_stats(&provision.database).await);
    assert_eq!(fx.fleet.command_targets("dbStats"), vec![fx.address(1)]);
}
