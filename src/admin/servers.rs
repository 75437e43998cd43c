//! Server introspection and availability

use bson::{doc, oid::ObjectId, Document};
use std::sync::Arc;
use tracing::info;

use crate::db::schemas::ServerDoc;
use crate::pool::{ClientHandle, ClientPool};
use crate::store::EntityStore;
use crate::types::{FleetError, Result};

/// Read-only questions a server can be asked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Status,
    Build,
    Databases,
    Collections { database: String },
    Users,
    Roles,
    Privileges,
    Commands,
    Features,
    Logs,
    Connections,
    HostInfo,
    ConnPoolStats,
}

impl Inspection {
    /// Database and command document to run
    pub fn command(&self) -> (&str, Document) {
        match self {
            Self::Status => ("admin", doc! { "serverStatus": 1 }),
            Self::Build => ("admin", doc! { "buildInfo": 1 }),
            Self::Databases => ("admin", doc! { "listDatabases": 1 }),
            Self::Collections { database } => (database.as_str(), doc! { "listCollections": 1 }),
            Self::Users => ("admin", doc! { "usersInfo": 1 }),
            Self::Roles => ("admin", doc! { "rolesInfo": 1 }),
            Self::Privileges => (
                "admin",
                doc! { "rolesInfo": 1, "showPrivileges": true, "showBuiltinRoles": true },
            ),
            Self::Commands => ("admin", doc! { "listCommands": 1 }),
            Self::Features => ("admin", doc! { "features": 1 }),
            Self::Logs => ("admin", doc! { "getLog": "global" }),
            Self::Connections => ("admin", doc! { "currentOp": 1 }),
            Self::HostInfo => ("admin", doc! { "hostInfo": 1 }),
            Self::ConnPoolStats => ("admin", doc! { "connPoolStats": 1 }),
        }
    }
}

pub struct ServerAdmin<S> {
    store: Arc<S>,
    pool: Arc<ClientPool>,
}

impl<S: EntityStore> ServerAdmin<S> {
    pub fn new(store: Arc<S>, pool: Arc<ClientPool>) -> Self {
        Self { store, pool }
    }

    async fn client(&self, server_id: &ObjectId) -> Result<Arc<ClientHandle>> {
        let server = self.store.resolve::<ServerDoc>(server_id).await?;
        self.pool.client_for(self.store.as_ref(), &server).await
    }

    pub async fn inspect(&self, server_id: &ObjectId, inspection: &Inspection) -> Result<Document> {
        if let Inspection::Collections { database } = inspection {
            if database.trim().is_empty() {
                return Err(FleetError::Validation("database name is required".into()));
            }
        }

        let client = self.client(server_id).await?;
        let (db, command) = inspection.command();
        client.run_command(db, command).await
    }

    /// Drop this server's outgoing pooled connections to `host:port`
    pub async fn drop_connection(&self, server_id: &ObjectId, host: &str, port: u16) -> Result<Document> {
        if host.trim().is_empty() {
            return Err(FleetError::Validation("host is required".into()));
        }

        let client = self.client(server_id).await?;
        let target = format!("{}:{}", host, port);
        let reply = client
            .admin(doc! { "dropConnections": 1, "hostAndPort": [&target] })
            .await?;

        info!(server = %client.server_name(), target = %target, "Dropped connections");
        Ok(reply)
    }

    pub async fn enable(&self, server_id: &ObjectId) -> Result<ServerDoc> {
        let server = self.store.resolve::<ServerDoc>(server_id).await?;
        if server.enabled {
            return Err(FleetError::Validation(format!("server '{}' already enabled", server.name)));
        }

        let server = self
            .store
            .update::<ServerDoc>(server_id, doc! { "$set": { "enabled": true } })
            .await?;
        info!(server = %server.name, "Server enabled");
        Ok(server)
    }

    /// Mark a server disabled and close its pooled client
    pub async fn disable(&self, server_id: &ObjectId) -> Result<ServerDoc> {
        let server = self.store.resolve::<ServerDoc>(server_id).await?;
        if !server.enabled {
            return Err(FleetError::Validation(format!("server '{}' already disabled", server.name)));
        }

        let server = self
            .store
            .update::<ServerDoc>(server_id, doc! { "$set": { "enabled": false } })
            .await?;
        self.pool.close_client(server_id).await;

        info!(server = %server.name, "Server disabled");
        Ok(server)
    }

    /// An enabled server in `zone`, else any enabled server
    pub async fn lookup(&self, zone: Option<&str>) -> Result<ServerDoc> {
        if let Some(zone) = zone {
            if let Some(server) = self
                .store
                .find_one::<ServerDoc>(doc! { "zone": zone, "enabled": true })
                .await?
            {
                return Ok(server);
            }
        }

        self.store
            .find_one::<ServerDoc>(doc! { "enabled": true })
            .await?
            .ok_or_else(|| FleetError::NotFound("no enabled server available".into()))
    }
}
