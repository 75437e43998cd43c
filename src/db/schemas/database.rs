//! Tenant database record

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::store::Entity;

/// Collection name for databases
pub const DATABASE_COLLECTION: &str = "databases";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DatabaseDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub name: String,

    /// Server the database was created on (the primary at the time)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ObjectId>,

    /// Replica set hosting the database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_set: Option<ObjectId>,

    /// Users granted on this database
    #[serde(default)]
    pub users: Vec<ObjectId>,
}

impl DatabaseDoc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            name: name.into(),
            server: None,
            replica_set: None,
            users: Vec::new(),
        }
    }

    pub fn on_server(mut self, server: ObjectId) -> Self {
        self.server = Some(server);
        self
    }

    pub fn in_replica_set(mut self, replica_set: ObjectId) -> Self {
        self.replica_set = Some(replica_set);
        self
    }
}

impl IntoIndexes for DatabaseDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "name": 1 },
                Some(IndexOptions::builder().name("name_index".to_string()).build()),
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

impl MutMetadata for DatabaseDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Entity for DatabaseDoc {
    const COLLECTION: &'static str = DATABASE_COLLECTION;
    const KIND: &'static str = "database";

    fn id(&self) -> Option<ObjectId> {
        self._id
    }

    fn set_id(&mut self, id: ObjectId) {
        self._id = Some(id);
    }
}
