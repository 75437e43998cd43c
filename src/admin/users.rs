//! Remote user administration
//!
//! A user record lists the databases it is granted on. Writes go to the
//! current primary of each database's replica set, one command per server
//! covering all of the user's databases there, and are then mirrored into
//! the record.

use bson::{doc, oid::ObjectId, Bson, Document};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::schemas::{is_builtin_role, DatabaseDoc, ServerDoc, UserDoc};
use crate::pool::ClientHandle;
use crate::store::{database_server, EntityStore};
use crate::topology::TopologyOrchestrator;
use crate::types::{FleetError, Result};

/// Reject empty lists and anything that is not a built-in MongoDB role
pub fn validate_roles(roles: &[String]) -> Result<()> {
    if roles.is_empty() {
        return Err(FleetError::Validation("at least one role is required".into()));
    }
    match roles.iter().find(|r| !is_builtin_role(r)) {
        Some(role) => Err(FleetError::Validation(format!("unknown role '{}'", role))),
        None => Ok(()),
    }
}

/// One server taking writes for some of the user's databases
struct Target {
    server: ServerDoc,
    client: Arc<ClientHandle>,
    databases: Vec<DatabaseDoc>,
}

impl Target {
    /// `roles` scoped to every database on this server
    fn role_documents(&self, roles: &[String]) -> Vec<Document> {
        self.databases
            .iter()
            .flat_map(|database| UserDoc::role_documents(roles, &database.name))
            .collect()
    }

    fn database_names(&self) -> Vec<&str> {
        self.databases.iter().map(|d| d.name.as_str()).collect()
    }
}

pub struct UserAdmin<S> {
    store: Arc<S>,
    topology: Arc<TopologyOrchestrator<S>>,
}

impl<S: EntityStore> UserAdmin<S> {
    pub fn new(store: Arc<S>, topology: Arc<TopologyOrchestrator<S>>) -> Self {
        Self { store, topology }
    }

    /// The user's databases grouped by the primary that takes their writes
    async fn targets(&self, user: &UserDoc) -> Result<Vec<Target>> {
        let mut targets: Vec<Target> = Vec::new();
        for id in &user.databases {
            let database = self.store.resolve::<DatabaseDoc>(id).await?;
            let primary = self.topology.database_primary(&database).await?;

            match targets.iter_mut().find(|t| t.server._id == primary.server._id) {
                Some(target) => target.databases.push(database),
                None => targets.push(Target {
                    server: primary.server,
                    client: primary.client,
                    databases: vec![database],
                }),
            }
        }
        Ok(targets)
    }

    async fn lookup(&self, user: &UserDoc, client: &ClientHandle) -> Result<Option<Document>> {
        let reply = client
            .run_command(
                &user.authdb,
                doc! { "usersInfo": { "user": &user.name, "db": &user.authdb } },
            )
            .await?;

        Ok(reply
            .get_array("users")
            .ok()
            .and_then(|users| users.first())
            .and_then(Bson::as_document)
            .cloned())
    }

    /// `usersInfo` for the user on every server hosting one of its databases.
    /// Read-only, so the recorded server answers even when it is a secondary.
    pub async fn info(&self, user_id: &ObjectId) -> Result<Vec<Document>> {
        let user = self.store.resolve::<UserDoc>(user_id).await?;
        let pool = self.topology.pool();

        let mut seen: Vec<ObjectId> = Vec::new();
        let mut found = Vec::new();
        for id in &user.databases {
            let database = self.store.resolve::<DatabaseDoc>(id).await?;
            let server = database_server(self.store.as_ref(), &database).await?;
            if server._id.is_some_and(|id| seen.contains(&id)) {
                continue;
            }
            seen.extend(server._id);

            let client = pool.client_for(self.store.as_ref(), &server).await?;
            match self.lookup(&user, &client).await? {
                Some(info) => found.push(info),
                None => warn!(user = %user.name, server = %server.name, "User missing on server"),
            }
        }
        Ok(found)
    }

    /// Create the user where it is missing and refresh its password and
    /// roles where it exists. One command per server carries the roles for
    /// every database the user has there, since `updateUser` replaces them.
    pub async fn ensure(&self, user_id: &ObjectId) -> Result<UserDoc> {
        let user = self.store.resolve::<UserDoc>(user_id).await?;

        for target in self.targets(&user).await? {
            let roles = target.role_documents(&user.roles);
            let exists = self.lookup(&user, &target.client).await?.is_some();

            let command = if exists {
                doc! { "updateUser": &user.name, "pwd": &user.password, "roles": roles }
            } else {
                doc! { "createUser": &user.name, "pwd": &user.password, "roles": roles }
            };
            target.client.run_command(&user.authdb, command).await?;

            info!(
                user = %user.name,
                server = %target.server.name,
                databases = ?target.database_names(),
                created = !exists,
                "User ensured"
            );
        }
        Ok(user)
    }

    /// Drop the user from every hosting server and remove its record
    pub async fn drop(&self, user_id: &ObjectId) -> Result<ObjectId> {
        let user = self.store.resolve::<UserDoc>(user_id).await?;

        let targets = self.targets(&user).await?;
        for target in &targets {
            target
                .client
                .run_command(&user.authdb, doc! { "dropUser": &user.name })
                .await?;
        }

        self.store.remove::<UserDoc>(user_id).await?;
        info!(user = %user.name, servers = targets.len(), "User dropped");
        Ok(*user_id)
    }

    pub async fn grant_roles(&self, user_id: &ObjectId, roles: &[String]) -> Result<UserDoc> {
        validate_roles(roles)?;
        let user = self.store.resolve::<UserDoc>(user_id).await?;

        for target in self.targets(&user).await? {
            target
                .client
                .run_command(
                    &user.authdb,
                    doc! { "grantRolesToUser": &user.name, "roles": target.role_documents(roles) },
                )
                .await?;
        }

        let user = self
            .store
            .update::<UserDoc>(user_id, doc! { "$addToSet": { "roles": { "$each": roles.to_vec() } } })
            .await?;
        info!(user = %user.name, roles = ?roles, "Roles granted");
        Ok(user)
    }

    pub async fn revoke_roles(&self, user_id: &ObjectId, roles: &[String]) -> Result<UserDoc> {
        validate_roles(roles)?;
        let user = self.store.resolve::<UserDoc>(user_id).await?;

        for target in self.targets(&user).await? {
            target
                .client
                .run_command(
                    &user.authdb,
                    doc! { "revokeRolesFromUser": &user.name, "roles": target.role_documents(roles) },
                )
                .await?;
        }

        let user = self
            .store
            .update::<UserDoc>(user_id, doc! { "$pull": { "roles": { "$in": roles.to_vec() } } })
            .await?;
        info!(user = %user.name, roles = ?roles, "Roles revoked");
        Ok(user)
    }
}
