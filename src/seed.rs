//! Fleet bootstrap from a JSON description
//!
//! ```json
//! {
//!   "root": { "name": "admin", "password": "password" },
//!   "replica_set": { "name": "rs1", "zone": "us-east-1" },
//!   "servers": [
//!     { "name": "mongodb-0", "host": "mongodb-0.mongodb.svc", "port": 27017, "zone": "us-east-1" }
//!   ],
//!   "initiate": true
//! }
//! ```
//!
//! Records that already exist (matched by name) are reused, so applying
//! the same seed twice is harmless.

use bson::{doc, oid::ObjectId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::db::schemas::{ReplicaSetDoc, ServerDoc, UserDoc};
use crate::store::{Entity, EntityStore};
use crate::topology::TopologyOrchestrator;
use crate::types::{FleetError, Result};

fn default_port() -> u16 {
    27017
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootSeed {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSetSeed {
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSeed {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub zone: String,
    /// Join the seeded replica set
    #[serde(default = "default_true")]
    pub member: bool,
    #[serde(default)]
    pub default_database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSeed {
    pub root: RootSeed,
    pub replica_set: ReplicaSetSeed,
    pub servers: Vec<ServerSeed>,
    /// Run `replSetInitiate` once the records exist
    #[serde(default)]
    pub initiate: bool,
}

impl FleetSeed {
    pub fn from_json(json: &str) -> Result<Self> {
        let seed: Self = serde_json::from_str(json)?;
        seed.validate()?;
        Ok(seed)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.name.is_empty() || self.root.password.is_empty() {
            return Err(FleetError::Validation("root name and password are required".into()));
        }
        if self.replica_set.name.is_empty() {
            return Err(FleetError::Validation("replica set name is required".into()));
        }
        if self.servers.is_empty() {
            return Err(FleetError::Validation("at least one server is required".into()));
        }

        let mut addresses: Vec<String> = Vec::new();
        for server in &self.servers {
            if server.host.is_empty() || server.port == 0 {
                return Err(FleetError::Validation(format!(
                    "server '{}' needs a host and a port",
                    server.name
                )));
            }
            let address = format!("{}:{}", server.host.to_ascii_lowercase(), server.port);
            if addresses.contains(&address) {
                return Err(FleetError::Validation(format!("duplicate server address {}", address)));
            }
            addresses.push(address);
        }
        Ok(())
    }
}

/// What a seed run produced
#[derive(Debug, Clone, Serialize)]
pub struct SeedReport {
    pub root: ObjectId,
    pub servers: Vec<ObjectId>,
    pub replica_set: ObjectId,
    pub initiated: bool,
}

async fn existing_or_create<S, T>(store: &S, name: &str, item: T) -> Result<T>
where
    S: EntityStore + ?Sized,
    T: Entity,
{
    match store.find_one::<T>(doc! { "name": name }).await? {
        Some(existing) => Ok(existing),
        None => store.create(item).await,
    }
}

fn id_of<T: Entity>(item: &T) -> Result<ObjectId> {
    item.id()
        .ok_or_else(|| FleetError::Internal(format!("{} has no id", T::KIND)))
}

/// Write the seed's records and, when asked and an orchestrator is given,
/// initiate the replica set
pub async fn apply<S: EntityStore>(
    store: &S,
    topology: Option<&TopologyOrchestrator<S>>,
    seed: &FleetSeed,
) -> Result<SeedReport> {
    seed.validate()?;

    let root = existing_or_create(
        store,
        &seed.root.name,
        UserDoc::new(&seed.root.name, &seed.root.password, vec!["root".to_string()]),
    )
    .await?;
    let root_id = id_of(&root)?;

    let mut replica_set = ReplicaSetDoc::new(&seed.replica_set.name);
    replica_set.zone = seed.replica_set.zone.clone();
    let replica_set = existing_or_create(store, &seed.replica_set.name, replica_set).await?;
    let replica_set_id = id_of(&replica_set)?;

    let mut servers = Vec::with_capacity(seed.servers.len());
    let mut members = Vec::new();
    for spec in &seed.servers {
        let mut server = ServerDoc::new(&spec.name, &spec.host, spec.port, &spec.zone).with_root(root_id);
        server.default_database = spec.default_database.clone();

        let server = existing_or_create(store, &spec.name, server).await?;
        let server_id = id_of(&server)?;
        servers.push(server_id);

        if spec.member {
            store
                .update::<ServerDoc>(&server_id, doc! { "$set": { "replica_set": replica_set_id } })
                .await?;
            members.push(server_id);
        }
    }

    store
        .update::<ReplicaSetDoc>(
            &replica_set_id,
            doc! {
                "$addToSet": {
                    "servers": { "$each": members.clone() },
                    "users": root_id,
                },
            },
        )
        .await?;

    let initiated = match topology {
        Some(topology) if seed.initiate => {
            topology.initiate(&replica_set_id).await?;
            true
        }
        _ => false,
    };

    info!(
        replica_set = %seed.replica_set.name,
        servers = servers.len(),
        members = members.len(),
        initiated,
        "Fleet seeded"
    );

    Ok(SeedReport {
        root: root_id,
        servers,
        replica_set: replica_set_id,
        initiated,
    })
}
