//! Replica set record
//!
//! The authoritative membership and config version live in the remote
//! replica-set config; `servers` and `config_version` only mirror it.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::store::Entity;

/// Collection name for replica sets
pub const REPLICA_SET_COLLECTION: &str = "replica_sets";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ReplicaSetDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Replica-set name, also the `_id` of the remote config
    pub name: String,

    /// Placement zone label used by provisioning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// Member servers, in config order
    #[serde(default)]
    pub servers: Vec<ObjectId>,

    /// Users provisioned on this replica set
    #[serde(default)]
    pub users: Vec<ObjectId>,

    /// Databases provisioned on this replica set
    #[serde(default)]
    pub databases: Vec<ObjectId>,

    /// Last config version applied through the orchestrator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_version: Option<i64>,
}

impl ReplicaSetDoc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            name: name.into(),
            zone: None,
            servers: Vec::new(),
            users: Vec::new(),
            databases: Vec::new(),
            config_version: None,
        }
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_servers(mut self, servers: Vec<ObjectId>) -> Self {
        self.servers = servers;
        self
    }
}

impl IntoIndexes for ReplicaSetDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "name": 1 },
                Some(IndexOptions::builder().name("name_index".to_string()).build()),
            ),
            (
                doc! { "zone": 1 },
                Some(
                    IndexOptions::builder()
                        .name("zone_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ReplicaSetDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Entity for ReplicaSetDoc {
    const COLLECTION: &'static str = REPLICA_SET_COLLECTION;
    const KIND: &'static str = "replica set";

    fn id(&self) -> Option<ObjectId> {
        self._id
    }

    fn set_id(&mut self, id: ObjectId) {
        self._id = Some(id);
    }
}
