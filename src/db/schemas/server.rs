//! MongoDB server record
//!
//! One `mongod` process of the fleet. Replica sets and databases refer to a
//! server by id; the server itself points back at its replica set.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::store::Entity;

/// Collection name for servers
pub const SERVER_COLLECTION: &str = "servers";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ServerDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Operator-facing name (e.g. "mongodb-0")
    pub name: String,

    /// Hostname or IP the fleet reaches the server on
    pub host: String,

    pub port: u16,

    /// Designated administrative credential (a User record)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<ObjectId>,

    /// Placement zone label (e.g. "us-east-1")
    pub zone: String,

    #[serde(default)]
    pub enabled: bool,

    /// Replica set this server is currently a member of
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_set: Option<ObjectId>,

    /// Default database path segment for admin connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_database: Option<String>,
}

impl ServerDoc {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, zone: impl Into<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            name: name.into(),
            host: host.into(),
            port,
            root: None,
            zone: zone.into(),
            enabled: true,
            replica_set: None,
            default_database: None,
        }
    }

    pub fn with_root(mut self, root: ObjectId) -> Self {
        self.root = Some(root);
        self
    }

    /// The `host:port` pair used in replica-set configs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl IntoIndexes for ServerDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "zone": 1, "enabled": 1 },
                Some(IndexOptions::builder().name("zone_enabled_index".to_string()).build()),
            ),
            (
                doc! { "host": 1, "port": 1 },
                Some(IndexOptions::builder().name("address_index".to_string()).build()),
            ),
            (
                doc! { "replica_set": 1 },
                Some(
                    IndexOptions::builder()
                        .name("replica_set_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ServerDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Entity for ServerDoc {
    const COLLECTION: &'static str = SERVER_COLLECTION;
    const KIND: &'static str = "server";

    fn id(&self) -> Option<ObjectId> {
        self._id
    }

    fn set_id(&mut self, id: ObjectId) {
        self._id = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address() {
        let server = ServerDoc::new("mongodb-0", "10.0.0.5", 27017, "us-east-1");
        assert_eq!(server.address(), "10.0.0.5:27017");
        assert!(server.enabled);
        assert!(server.root.is_none());
    }

    #[test]
    fn test_bson_shape() {
        let root = ObjectId::new();
        let server = ServerDoc::new("mongodb-0", "db-0", 27018, "eu").with_root(root);
        let doc = bson::to_document(&server).unwrap();

        assert!(!doc.contains_key("_id"));
        assert!(!doc.contains_key("replica_set"));
        assert_eq!(doc.get_object_id("root").unwrap(), root);

        let back: ServerDoc = bson::from_document(doc).unwrap();
        assert_eq!(back.port, 27018);
    }
}
