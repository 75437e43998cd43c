//! Provision record
//!
//! One tenant allocation: exactly one user paired with exactly one database
//! on a replica set. Created only by provisioning, removed only by
//! deprovisioning.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::store::Entity;

/// Collection name for provisions
pub const PROVISION_COLLECTION: &str = "provisions";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProvisionDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub user: ObjectId,

    pub database: ObjectId,

    pub replica_set: ObjectId,

    /// Zone requested by the caller (may differ from the replica set's)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    pub prefix: String,
}

impl ProvisionDoc {
    pub fn new(user: ObjectId, database: ObjectId, replica_set: ObjectId, prefix: impl Into<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            user,
            database,
            replica_set,
            zone: None,
            prefix: prefix.into(),
        }
    }

    pub fn with_zone(mut self, zone: Option<String>) -> Self {
        self.zone = zone;
        self
    }
}

impl IntoIndexes for ProvisionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "user": 1 },
                Some(IndexOptions::builder().name("user_index".to_string()).build()),
            ),
            (
                doc! { "database": 1 },
                Some(IndexOptions::builder().name("database_index".to_string()).build()),
            ),
        ]
    }
}

impl MutMetadata for ProvisionDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Entity for ProvisionDoc {
    const COLLECTION: &'static str = PROVISION_COLLECTION;
    const KIND: &'static str = "provision";

    fn id(&self) -> Option<ObjectId> {
        self._id
    }

    fn set_id(&mut self, id: ObjectId) {
        self._id = Some(id);
    }
}
