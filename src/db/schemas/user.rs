//! Database user record
//!
//! Mirrors a user created on a fleet member. The password is stored so that
//! provisions can be packed into connection strings.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use super::metadata::Metadata;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::store::Entity;

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// Built-in MongoDB roles a user may be granted
pub const BUILTIN_ROLES: &[&str] = &[
    "read",
    "readWrite",
    "dbAdmin",
    "dbOwner",
    "userAdmin",
    "clusterAdmin",
    "clusterManager",
    "clusterMonitor",
    "hostManager",
    "backup",
    "restore",
    "readAnyDatabase",
    "readWriteAnyDatabase",
    "userAdminAnyDatabase",
    "dbAdminAnyDatabase",
    "root",
];

pub fn is_builtin_role(role: &str) -> bool {
    BUILTIN_ROLES.contains(&role)
}

fn default_authdb() -> String {
    "admin".to_string()
}

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct UserDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub name: String,

    pub password: String,

    #[serde(default)]
    pub roles: Vec<String>,

    /// Databases the roles are granted on
    #[serde(default)]
    pub databases: Vec<ObjectId>,

    /// Authentication database the user is created in
    #[serde(default = "default_authdb")]
    pub authdb: String,
}

impl UserDoc {
    pub fn new(name: impl Into<String>, password: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            name: name.into(),
            password: password.into(),
            roles,
            databases: Vec::new(),
            authdb: default_authdb(),
        }
    }

    pub fn with_databases(mut self, databases: Vec<ObjectId>) -> Self {
        self.databases = databases;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// `[{role, db}]` role documents scoped to one database
    pub fn role_documents(roles: &[String], database: &str) -> Vec<Document> {
        roles
            .iter()
            .map(|role| doc! { "role": role, "db": database })
            .collect()
    }
}

// Keep the password out of logs
impl std::fmt::Debug for UserDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDoc")
            .field("_id", &self._id)
            .field("name", &self.name)
            .field("password", &"****")
            .field("roles", &self.roles)
            .field("databases", &self.databases)
            .field("authdb", &self.authdb)
            .finish()
    }
}

impl IntoIndexes for UserDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "name": 1 },
            Some(IndexOptions::builder().name("name_index".to_string()).build()),
        )]
    }
}

impl MutMetadata for UserDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Entity for UserDoc {
    const COLLECTION: &'static str = USER_COLLECTION;
    const KIND: &'static str = "user";

    fn id(&self) -> Option<ObjectId> {
        self._id
    }

    fn set_id(&mut self, id: ObjectId) {
        self._id = Some(id);
    }
}
