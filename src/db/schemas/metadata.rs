//! Common metadata for all fleet records
//!
//! Creation and update timestamps plus the soft-delete scope: a record with
//! `is_deleted` set is invisible to every default lookup.

use bson::DateTime;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    /// Whether this record has been soft-deleted
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,
}

impl Metadata {
    /// Fresh metadata stamped with the current time
    pub fn new() -> Self {
        let now = DateTime::now();
        Self {
            is_deleted: false,
            deleted_at: None,
            updated_at: Some(now),
            created_at: Some(now),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(DateTime::now());
    }

    /// Move the record out of the default scope
    pub fn mark_deleted(&mut self) {
        let now = DateTime::now();
        self.is_deleted = true;
        self.deleted_at = Some(now);
        self.updated_at = Some(now);
    }

    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }
}
