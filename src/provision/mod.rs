//! Tenant provisioning
//!
//! A provision pairs one database with one user on a replica set. Creating
//! one touches both the primary (the remote user) and the entity store (the
//! Database, User and Provision records plus the replica set's lists), with
//! no transaction spanning them, so every step records its compensation in a
//! [`Saga`] and a failure unwinds the steps already taken.

mod names;
mod pack;
mod saga;

pub use names::{
    generate_name, generate_password, validate_prefix, DEFAULT_PREFIX, MAX_PREFIX_LEN, PASSWORD_LEN,
    SUFFIX_LEN,
};
pub use pack::ConnectionPack;
pub use saga::{Compensation, Saga};

use bson::{doc, oid::ObjectId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::schemas::{DatabaseDoc, ProvisionDoc, ReplicaSetDoc, UserDoc};
use crate::store::{database_server, replica_set_members, Entity, EntityStore};
use crate::topology::{Primary, TopologyOrchestrator};
use crate::types::{FleetError, Result};

/// Role granted to every provisioned user, scoped to its database
pub const PROVISION_ROLE: &str = "dbOwner";

/// Attempts at drawing a name not already used by a record
pub const MAX_NAME_ATTEMPTS: usize = 5;

/// Allocates and releases tenant database/user pairs
pub struct ProvisioningAllocator<S> {
    store: Arc<S>,
    topology: Arc<TopologyOrchestrator<S>>,
}

impl<S: EntityStore> ProvisioningAllocator<S> {
    pub fn new(store: Arc<S>, topology: Arc<TopologyOrchestrator<S>>) -> Self {
        Self { store, topology }
    }

    /// A replica set in `zone`, else any replica set
    pub async fn select_replica_set(&self, zone: Option<&str>) -> Result<ReplicaSetDoc> {
        if let Some(zone) = zone {
            if let Some(replica_set) = self.store.find_one::<ReplicaSetDoc>(doc! { "zone": zone }).await? {
                return Ok(replica_set);
            }
            debug!(zone = %zone, "No replica set in zone, falling back to any");
        }

        self.store
            .find_one::<ReplicaSetDoc>(doc! {})
            .await?
            .ok_or_else(|| FleetError::NotFound("no replica set available".into()))
    }

    /// Primary among the replica set's enabled members
    async fn write_target(&self, replica_set: &ReplicaSetDoc) -> Result<Primary> {
        let members: Vec<_> = replica_set_members(self.store.as_ref(), replica_set)
            .await?
            .into_iter()
            .filter(|server| server.enabled)
            .collect();

        self.topology
            .discover_primary(&members)
            .await
            .ok_or_else(|| FleetError::NoPrimary(replica_set.name.clone()))
    }

    /// Draw `{prefix}_{suffix}` names until one is unused by records of type `T`
    async fn unique_name<T: Entity>(&self, prefix: &str) -> Result<String> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = generate_name(prefix);
            if self.store.find_one::<T>(doc! { "name": &name }).await?.is_none() {
                return Ok(name);
            }
            debug!(name = %name, kind = T::KIND, "Generated name taken, retrying");
        }
        Err(FleetError::Internal(format!(
            "no unused {} name after {} attempts",
            T::KIND,
            MAX_NAME_ATTEMPTS
        )))
    }

    /// Allocate a database and an owning user on a replica set in `zone`.
    /// Returns the new provision's id.
    pub async fn provision(&self, zone: Option<&str>, prefix: Option<&str>) -> Result<ObjectId> {
        let prefix = prefix.unwrap_or(DEFAULT_PREFIX);
        validate_prefix(prefix)?;

        let replica_set = self.select_replica_set(zone).await?;
        let replica_set_id = replica_set
            .id()
            .ok_or_else(|| FleetError::Internal(format!("replica set '{}' has no id", replica_set.name)))?;

        let primary = self.write_target(&replica_set).await?;
        let server_id = primary
            .server
            ._id
            .ok_or_else(|| FleetError::Internal(format!("server '{}' has no id", primary.server.name)))?;

        let database_name = self.unique_name::<DatabaseDoc>(prefix).await?;
        let user_name = self.unique_name::<UserDoc>(prefix).await?;
        let roles = vec![PROVISION_ROLE.to_string()];

        let mut saga = Saga::new(format!("provision {}", database_name));
        let result = self
            .run_provision(
                &mut saga,
                &primary,
                server_id,
                &replica_set,
                replica_set_id,
                zone,
                prefix,
                &database_name,
                UserDoc::new(&user_name, generate_password(), roles),
            )
            .await;

        match result {
            Ok(id) => {
                saga.commit();
                info!(
                    provision = %id,
                    replica_set = %replica_set.name,
                    server = %primary.server.name,
                    database = %database_name,
                    user = %user_name,
                    "Provisioned"
                );
                Ok(id)
            }
            Err(e) => {
                warn!(database = %database_name, error = %e, steps = saga.len(), "Provision failed, rolling back");
                saga.compensate(self.store.as_ref()).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_provision(
        &self,
        saga: &mut Saga,
        primary: &Primary,
        server_id: ObjectId,
        replica_set: &ReplicaSetDoc,
        replica_set_id: ObjectId,
        zone: Option<&str>,
        prefix: &str,
        database_name: &str,
        user: UserDoc,
    ) -> Result<ObjectId> {
        primary
            .client
            .run_command(
                &user.authdb,
                doc! {
                    "createUser": &user.name,
                    "pwd": &user.password,
                    "roles": UserDoc::role_documents(&user.roles, database_name),
                },
            )
            .await?;
        saga.record(Compensation::DropRemoteUser {
            client: primary.client.clone(),
            authdb: user.authdb.clone(),
            name: user.name.clone(),
        });

        let database = self
            .store
            .create(
                DatabaseDoc::new(database_name)
                    .on_server(server_id)
                    .in_replica_set(replica_set_id),
            )
            .await?;
        let database_id = created_id(&database)?;
        saga.record(Compensation::RemoveDatabase(database_id));

        let user = self.store.create(user.with_databases(vec![database_id])).await?;
        let user_id = created_id(&user)?;
        saga.record(Compensation::RemoveUser(user_id));

        self.store
            .update::<DatabaseDoc>(&database_id, doc! { "$addToSet": { "users": user_id } })
            .await?;

        self.store
            .update::<ReplicaSetDoc>(
                &replica_set_id,
                doc! { "$addToSet": { "users": user_id, "databases": database_id } },
            )
            .await?;
        saga.record(Compensation::Detach {
            replica_set: replica_set_id,
            user: user_id,
            database: database_id,
        });

        let provision = self
            .store
            .create(
                ProvisionDoc::new(user_id, database_id, replica_set_id, prefix)
                    .with_zone(zone.map(str::to_string)),
            )
            .await?;

        debug!(replica_set = %replica_set.name, "Provision records written");
        created_id(&provision)
    }

    /// Connection details for a provision. Read-only.
    pub async fn pack(&self, provision_id: &ObjectId) -> Result<ConnectionPack> {
        let provision = self.store.resolve::<ProvisionDoc>(provision_id).await?;
        let user = self.store.resolve::<UserDoc>(&provision.user).await?;
        let database = self.store.resolve::<DatabaseDoc>(&provision.database).await?;
        let server = database_server(self.store.as_ref(), &database).await?;
        let replica_set = self.store.resolve::<ReplicaSetDoc>(&provision.replica_set).await?;

        debug!(provision = %provision_id, "Packed provision");
        Ok(ConnectionPack::new(
            user.name,
            user.password,
            database.name,
            server.host,
            server.port,
            replica_set.name,
        ))
    }

    /// Release a provision. Remote cleanup is best effort: failures are
    /// logged and the records are removed regardless. Returns the id.
    pub async fn deprovision(&self, provision_id: &ObjectId) -> Result<ObjectId> {
        let provision = self.store.resolve::<ProvisionDoc>(provision_id).await?;
        let user = self.store.resolve::<UserDoc>(&provision.user).await?;
        let database = self.store.resolve::<DatabaseDoc>(&provision.database).await?;
        let replica_set = self.store.resolve::<ReplicaSetDoc>(&provision.replica_set).await?;

        let primary = self.write_target(&replica_set).await?;
        let client = &primary.client;

        let cleanup = [
            (user.authdb.as_str(), doc! { "dropUser": &user.name }),
            (database.name.as_str(), doc! { "dropAllUsersFromDatabase": 1 }),
            (database.name.as_str(), doc! { "dropDatabase": 1 }),
        ];
        for (db, command) in cleanup {
            let name = crate::pool::command_name(&command).to_string();
            if let Err(e) = client.run_command(db, command).await {
                warn!(
                    provision = %provision_id,
                    db = %db,
                    command = %name,
                    error = %e,
                    "Cleanup command failed, continuing"
                );
            }
        }

        self.store.remove::<DatabaseDoc>(&provision.database).await?;
        self.store.remove::<UserDoc>(&provision.user).await?;
        self.store
            .update::<ReplicaSetDoc>(
                &provision.replica_set,
                doc! { "$pull": { "users": provision.user, "databases": provision.database } },
            )
            .await?;
        self.store.remove::<ProvisionDoc>(provision_id).await?;

        info!(
            provision = %provision_id,
            replica_set = %replica_set.name,
            database = %database.name,
            user = %user.name,
            "Deprovisioned"
        );
        Ok(*provision_id)
    }
}

fn created_id<T: Entity>(item: &T) -> Result<ObjectId> {
    item.id()
        .ok_or_else(|| FleetError::Internal(format!("created {} has no id", T::KIND)))
}
