//! Replica-set config document editing

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

use crate::types::{FleetError, Result};

/// Highest member priority MongoDB accepts
pub const MAX_PRIORITY: f64 = 1000.0;

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// A replica-set config as returned by `replSetGetConfig`.
///
/// Fields this crate does not touch (settings, protocolVersion, tags...) are
/// carried through unchanged so a reconfig never drops them.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplSetConfig(Document);

impl ReplSetConfig {
    /// Initial config for `replSetInitiate`: version 1, members numbered
    /// from 0 in the order given
    pub fn initial<'a>(name: &str, hosts: impl IntoIterator<Item = &'a str>) -> Self {
        let members: Vec<Bson> = hosts
            .into_iter()
            .enumerate()
            .map(|(i, host)| Bson::Document(doc! { "_id": i as i32, "host": host }))
            .collect();

        Self(doc! { "_id": name, "version": 1, "members": members })
    }

    /// Extract the config from a `replSetGetConfig` reply
    pub fn from_reply(reply: &Document) -> Result<Self> {
        reply
            .get_document("config")
            .map(|config| Self(config.clone()))
            .map_err(|_| FleetError::remote("replSetGetConfig", "reply carries no config document"))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get_str("_id").ok()
    }

    pub fn version(&self) -> i64 {
        self.0.get("version").and_then(as_i64).unwrap_or(0)
    }

    /// Increment the version, keeping its BSON integer width
    pub fn bump_version(&mut self) -> i64 {
        let next = self.version() + 1;
        let value = match self.0.get("version") {
            Some(Bson::Int64(_)) => Bson::Int64(next),
            _ => match i32::try_from(next) {
                Ok(v) => Bson::Int32(v),
                Err(_) => Bson::Int64(next),
            },
        };
        self.0.insert("version", value);
        next
    }

    pub fn members(&self) -> Vec<&Document> {
        match self.0.get_array("members") {
            Ok(members) => members.iter().filter_map(Bson::as_document).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.members()
            .into_iter()
            .filter_map(|m| m.get_str("host").ok())
            .collect()
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.hosts().iter().any(|h| h.eq_ignore_ascii_case(host))
    }

    /// One past the highest remaining member `_id`. Ids below the maximum
    /// that were freed stay unused, but removing the highest member frees
    /// its id for the next addition.
    pub fn next_member_id(&self) -> i64 {
        self.members()
            .into_iter()
            .filter_map(|m| m.get("_id").and_then(as_i64))
            .max()
            .map_or(0, |max| max + 1)
    }

    /// Append a member entry and return its `_id`
    pub fn push_member(&mut self, host: &str, options: &MemberOptions) -> i64 {
        let id = self.next_member_id();
        let member = options.member_document(id, host);

        match self.0.get_array_mut("members") {
            Ok(members) => members.push(Bson::Document(member)),
            Err(_) => {
                self.0.insert("members", vec![Bson::Document(member)]);
            }
        }
        id
    }

    /// Drop the member with `host`. Returns false when it was not present.
    pub fn remove_host(&mut self, host: &str) -> bool {
        let Ok(members) = self.0.get_array_mut("members") else {
            return false;
        };
        let before = members.len();
        members.retain(|m| {
            !m.as_document()
                .and_then(|d| d.get_str("host").ok())
                .is_some_and(|h| h.eq_ignore_ascii_case(host))
        });
        members.len() != before
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_document(self) -> Document {
        self.0
    }
}

/// Options for a new replica-set member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberOptions {
    pub arbiter_only: bool,
    pub build_indexes: bool,
    pub hidden: bool,
    pub priority: f64,
    pub votes: i32,
}

impl Default for MemberOptions {
    fn default() -> Self {
        Self {
            arbiter_only: false,
            build_indexes: true,
            hidden: false,
            priority: 1.0,
            votes: 1,
        }
    }
}

impl MemberOptions {
    /// Reject combinations MongoDB would refuse at reconfig time
    pub fn validate(&self) -> Result<()> {
        if !(0..=1).contains(&self.votes) {
            return Err(FleetError::Validation(format!(
                "votes must be 0 or 1, got {}",
                self.votes
            )));
        }
        if !(0.0..=MAX_PRIORITY).contains(&self.priority) {
            return Err(FleetError::Validation(format!(
                "priority must be between 0 and {}, got {}",
                MAX_PRIORITY, self.priority
            )));
        }
        if self.hidden && self.priority != 0.0 {
            return Err(FleetError::Validation("hidden members must have priority 0".into()));
        }
        if !self.build_indexes && self.priority != 0.0 {
            return Err(FleetError::Validation(
                "members that do not build indexes must have priority 0".into(),
            ));
        }
        if self.arbiter_only {
            if self.hidden {
                return Err(FleetError::Validation("arbiters cannot be hidden".into()));
            }
            if self.priority != 0.0 {
                return Err(FleetError::Validation("arbiters must have priority 0".into()));
            }
        }
        Ok(())
    }

    pub fn member_document(&self, id: i64, host: &str) -> Document {
        let id = match i32::try_from(id) {
            Ok(v) => Bson::Int32(v),
            Err(_) => Bson::Int64(id),
        };
        doc! {
            "_id": id,
            "host": host,
            "arbiterOnly": self.arbiter_only,
            "buildIndexes": self.build_indexes,
            "hidden": self.hidden,
            "priority": self.priority,
            "votes": self.votes,
        }
    }
}
