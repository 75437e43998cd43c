//! Replica-set topology orchestration
//!
//! Finds the write primary of a replica set and applies versioned
//! membership changes through `replSetReconfig`. Nothing here is persisted
//! beyond the record back-references and the cached config version; the
//! remote config stays authoritative.

mod config;

pub use config::{MemberOptions, ReplSetConfig, MAX_PRIORITY};

use bson::{doc, oid::ObjectId, Bson, Document};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::schemas::{DatabaseDoc, ReplicaSetDoc, ServerDoc};
use crate::pool::{ClientHandle, ClientPool};
use crate::store::{database_server, replica_set_members, EntityStore};
use crate::types::{FleetError, Result};

/// Default per-member `hello` timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default number of members probed at once
pub const DEFAULT_PROBE_CONCURRENCY: usize = 4;

/// Primary-discovery tuning
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            concurrency: DEFAULT_PROBE_CONCURRENCY,
        }
    }
}

/// Replica-set state, inferred from the members on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSetState {
    Uninitiated,
    Stable,
    Reconfiguring,
}

impl std::fmt::Display for ReplicaSetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitiated => write!(f, "uninitiated"),
            Self::Stable => write!(f, "stable"),
            Self::Reconfiguring => write!(f, "reconfiguring"),
        }
    }
}

/// Whether a `hello` reply comes from the primary itself
pub fn reports_self_primary(hello: &Document) -> bool {
    match (hello.get_str("primary"), hello.get_str("me")) {
        (Ok(primary), Ok(me)) => primary == me,
        _ => false,
    }
}

/// State from a `replSetGetStatus` reply: stable only when a primary exists
/// and every member is PRIMARY, SECONDARY or ARBITER
pub fn infer_state(status: &Document) -> ReplicaSetState {
    let members = match status.get_array("members") {
        Ok(members) => members,
        Err(_) => return ReplicaSetState::Reconfiguring,
    };

    let states: Vec<&str> = members
        .iter()
        .filter_map(Bson::as_document)
        .map(|m| m.get_str("stateStr").unwrap_or("UNKNOWN"))
        .collect();

    let settled = states
        .iter()
        .all(|s| matches!(*s, "PRIMARY" | "SECONDARY" | "ARBITER"));

    if settled && states.contains(&"PRIMARY") {
        ReplicaSetState::Stable
    } else {
        ReplicaSetState::Reconfiguring
    }
}

fn is_uninitiated(err: &FleetError) -> bool {
    let message = err.to_string();
    message.contains("NotYetInitialized") || message.contains("no replset config")
}

/// The current primary of a replica set with a live client to it
#[derive(Debug)]
pub struct Primary {
    pub server: ServerDoc,
    pub client: Arc<ClientHandle>,
}

/// Stateless coordinator over the pool and the entity store
pub struct TopologyOrchestrator<S> {
    store: Arc<S>,
    pool: Arc<ClientPool>,
    probe: ProbeConfig,
}

impl<S: EntityStore> TopologyOrchestrator<S> {
    pub fn new(store: Arc<S>, pool: Arc<ClientPool>) -> Self {
        Self {
            store,
            pool,
            probe: ProbeConfig::default(),
        }
    }

    pub fn with_probe_config(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// `hello` one member. Any failure counts as "not primary".
    async fn probe(&self, server: &ServerDoc) -> Option<Arc<ClientHandle>> {
        let attempt = async {
            let client = self.pool.client_for(self.store.as_ref(), server).await?;
            let hello = client.admin(doc! { "hello": 1 }).await?;
            Ok::<_, FleetError>(reports_self_primary(&hello).then_some(client))
        };

        match tokio::time::timeout(self.probe.timeout, attempt).await {
            Ok(Ok(found)) => {
                debug!(server = %server.name, primary = found.is_some(), "Probed member");
                found
            }
            Ok(Err(e)) => {
                warn!(server = %server.name, error = %e, "Member probe failed");
                None
            }
            Err(_) => {
                warn!(server = %server.name, timeout = ?self.probe.timeout, "Member probe timed out");
                None
            }
        }
    }

    /// First member, in the given order, that reports itself as primary.
    ///
    /// Up to `concurrency` probes run at once, but results are consumed in
    /// member order so the answer does not depend on which probe lands
    /// first.
    pub async fn discover_primary(&self, members: &[ServerDoc]) -> Option<Primary> {
        let concurrency = self.probe.concurrency.max(1);
        let mut probes = stream::iter(members)
            .map(|server| async move { (server, self.probe(server).await) })
            .buffered(concurrency);

        while let Some((server, found)) = probes.next().await {
            if let Some(client) = found {
                return Some(Primary {
                    server: server.clone(),
                    client,
                });
            }
        }
        None
    }

    /// Primary of `replica_set`, or `NoPrimary`
    pub async fn require_primary(&self, replica_set: &ReplicaSetDoc) -> Result<Primary> {
        let members = replica_set_members(self.store.as_ref(), replica_set).await?;
        self.discover_primary(&members)
            .await
            .ok_or_else(|| FleetError::NoPrimary(replica_set.name.clone()))
    }

    /// Write target for `database`: the current primary of its replica set,
    /// or its recorded server when it belongs to none
    pub async fn database_primary(&self, database: &DatabaseDoc) -> Result<Primary> {
        match database.replica_set {
            Some(id) => {
                let replica_set = self.store.resolve::<ReplicaSetDoc>(&id).await?;
                self.require_primary(&replica_set).await
            }
            None => {
                let server = database_server(self.store.as_ref(), database).await?;
                let client = self.pool.client_for(self.store.as_ref(), &server).await?;
                Ok(Primary { server, client })
            }
        }
    }

    async fn resolve_pair(&self, replica_set_id: &ObjectId, server_id: &ObjectId) -> Result<(ReplicaSetDoc, ServerDoc)> {
        let replica_set = self.store.resolve::<ReplicaSetDoc>(replica_set_id).await?;
        let server = self.store.resolve::<ServerDoc>(server_id).await?;
        Ok((replica_set, server))
    }

    async fn fetch_config(&self, primary: &Primary) -> Result<ReplSetConfig> {
        let reply = primary.client.admin(doc! { "replSetGetConfig": 1 }).await?;
        ReplSetConfig::from_reply(&reply)
    }

    /// Issue `replSetInitiate` on the first member with every member of the
    /// replica set, in order. Returns the server's reply.
    pub async fn initiate(&self, replica_set_id: &ObjectId) -> Result<Document> {
        let replica_set = self.store.resolve::<ReplicaSetDoc>(replica_set_id).await?;
        let members = replica_set_members(self.store.as_ref(), &replica_set).await?;

        let first = members.first().ok_or_else(|| {
            FleetError::Validation(format!("replica set '{}' has no members", replica_set.name))
        })?;

        let addresses: Vec<String> = members.iter().map(ServerDoc::address).collect();
        let config = ReplSetConfig::initial(&replica_set.name, addresses.iter().map(String::as_str));

        let client = self.pool.client_for(self.store.as_ref(), first).await?;
        let reply = client
            .admin(doc! { "replSetInitiate": config.as_document().clone() })
            .await?;

        self.store
            .update::<ReplicaSetDoc>(replica_set_id, doc! { "$set": { "config_version": config.version() } })
            .await?;

        info!(
            replica_set = %replica_set.name,
            members = members.len(),
            "Replica set initiated"
        );
        Ok(reply)
    }

    /// Add `server` to the replica set. Returns the new config version.
    ///
    /// A host already in the remote config is rejected with `MemberExists`
    /// and nothing changes.
    pub async fn add_member(
        &self,
        replica_set_id: &ObjectId,
        server_id: &ObjectId,
        options: &MemberOptions,
    ) -> Result<i64> {
        options.validate()?;
        let (replica_set, server) = self.resolve_pair(replica_set_id, server_id).await?;

        if let Some(current) = server.replica_set.filter(|rs| rs != replica_set_id) {
            return Err(FleetError::Validation(format!(
                "server '{}' already belongs to replica set {}",
                server.name, current
            )));
        }

        let primary = self.require_primary(&replica_set).await?;
        let mut config = self.fetch_config(&primary).await?;

        let host = server.address();
        if config.contains_host(&host) {
            return Err(FleetError::MemberExists(host));
        }

        let version = config.bump_version();
        let member_id = config.push_member(&host, options);

        primary
            .client
            .admin(doc! { "replSetReconfig": config.into_document() })
            .await?;

        self.store
            .update::<ServerDoc>(server_id, doc! { "$set": { "replica_set": replica_set_id } })
            .await?;
        self.store
            .update::<ReplicaSetDoc>(
                replica_set_id,
                doc! {
                    "$addToSet": { "servers": server_id },
                    "$set": { "config_version": version },
                },
            )
            .await?;

        info!(
            replica_set = %replica_set.name,
            server = %server.name,
            host = %host,
            member_id,
            version,
            "Member added"
        );
        Ok(version)
    }

    /// Remove `server` from the replica set. Returns the new config version.
    pub async fn remove_member(&self, replica_set_id: &ObjectId, server_id: &ObjectId) -> Result<i64> {
        let (replica_set, server) = self.resolve_pair(replica_set_id, server_id).await?;

        let primary = self.require_primary(&replica_set).await?;
        let mut config = self.fetch_config(&primary).await?;

        let host = server.address();
        if !config.remove_host(&host) {
            return Err(FleetError::not_found("replica set member", &host));
        }
        let version = config.bump_version();

        primary
            .client
            .admin(doc! { "replSetReconfig": config.into_document() })
            .await?;

        self.store
            .update::<ServerDoc>(server_id, doc! { "$unset": { "replica_set": "" } })
            .await?;
        self.store
            .update::<ReplicaSetDoc>(
                replica_set_id,
                doc! {
                    "$pull": { "servers": server_id },
                    "$set": { "config_version": version },
                },
            )
            .await?;

        info!(
            replica_set = %replica_set.name,
            server = %server.name,
            host = %host,
            version,
            "Member removed"
        );
        Ok(version)
    }

    /// Infer the replica set's state from the first member that answers
    /// `replSetGetStatus`
    pub async fn state(&self, replica_set_id: &ObjectId) -> Result<ReplicaSetState> {
        let replica_set = self.store.resolve::<ReplicaSetDoc>(replica_set_id).await?;
        let members = replica_set_members(self.store.as_ref(), &replica_set).await?;

        let mut last_error = None;
        for server in &members {
            let reply = match self.pool.client_for(self.store.as_ref(), server).await {
                Ok(client) => client.admin(doc! { "replSetGetStatus": 1 }).await,
                Err(e) => Err(e),
            };

            match reply {
                Ok(status) => return Ok(infer_state(&status)),
                Err(e) if is_uninitiated(&e) => return Ok(ReplicaSetState::Uninitiated),
                Err(e) => {
                    warn!(server = %server.name, error = %e, "Status probe failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FleetError::Validation(format!("replica set '{}' has no members", replica_set.name))
        }))
    }

    /// Raw `replSetGetStatus` from the primary
    pub async fn status(&self, replica_set_id: &ObjectId) -> Result<Document> {
        let replica_set = self.store.resolve::<ReplicaSetDoc>(replica_set_id).await?;
        let primary = self.require_primary(&replica_set).await?;
        primary.client.admin(doc! { "replSetGetStatus": 1 }).await
    }

    /// Ask the primary to step down for `seconds`
    pub async fn step_down(&self, replica_set_id: &ObjectId, seconds: u32) -> Result<Document> {
        let replica_set = self.store.resolve::<ReplicaSetDoc>(replica_set_id).await?;
        let primary = self.require_primary(&replica_set).await?;

        let reply = primary
            .client
            .admin(doc! { "replSetStepDown": i64::from(seconds) })
            .await?;

        info!(
            replica_set = %replica_set.name,
            server = %primary.server.name,
            seconds,
            "Primary stepped down"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_self_primary() {
        assert!(reports_self_primary(&doc! { "primary": "a:1", "me": "a:1" }));
        assert!(!reports_self_primary(&doc! { "primary": "a:1", "me": "b:1" }));
        assert!(!reports_self_primary(&doc! { "me": "b:1" }));
        assert!(!reports_self_primary(&doc! { "isWritablePrimary": true }));
    }

    #[test]
    fn test_infer_state() {
        let stable = doc! { "members": [
            { "stateStr": "PRIMARY" },
            { "stateStr": "SECONDARY" },
            { "stateStr": "ARBITER" },
        ] };
        assert_eq!(infer_state(&stable), ReplicaSetState::Stable);

        let syncing = doc! { "members": [
            { "stateStr": "PRIMARY" },
            { "stateStr": "STARTUP2" },
        ] };
        assert_eq!(infer_state(&syncing), ReplicaSetState::Reconfiguring);

        let electing = doc! { "members": [
            { "stateStr": "SECONDARY" },
            { "stateStr": "SECONDARY" },
        ] };
        assert_eq!(infer_state(&electing), ReplicaSetState::Reconfiguring);
    }

    #[test]
    fn test_uninitiated_error_detection() {
        let err = FleetError::remote(
            "replSetGetStatus",
            "Command failed with error 94 (NotYetInitialized): 'no replset config has been received'",
        );
        assert!(is_uninitiated(&err));
        assert!(!is_uninitiated(&FleetError::remote("replSetGetStatus", "connection refused")));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ReplicaSetState::Uninitiated.to_string(), "uninitiated");
        assert_eq!(
            serde_json::to_string(&ReplicaSetState::Reconfiguring).unwrap(),
            "\"reconfiguring\""
        );
    }
}
